// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand running the fence evaluation engine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Error;
use base::clock::RealClocks;
use base::shutdown;
use bpaf::Bpaf;
use rumqttc::{Event, Packet};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::cfg::{self, Settings};
use crate::db;
use crate::fence::{EngineState, FenceEngine};
use crate::mqtt;

const CLIENT_ID: &str = "fenceline-fence";
const DEFAULT_TOPIC: &str = "vision/+/detections";
const EVICT_PERIOD: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Evaluates detection messages against virtual fences and stores events.
#[derive(Bpaf, Debug)]
#[bpaf(command("fence"))]
pub struct Args {
    /// Path to the camera catalog, overriding `CAMERAS_JSON`.
    #[bpaf(long("cameras"), argument("PATH"))]
    cameras: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let settings = Settings::from_env();
    let cameras_path = args.cameras.unwrap_or_else(|| settings.cameras_json.clone());
    super::run_with_shutdown(|shutdown_rx| inner(settings, cameras_path, shutdown_rx))
}

async fn inner(
    settings: Settings,
    cameras_path: PathBuf,
    shutdown_rx: shutdown::Receiver,
) -> Result<i32, Error> {
    let mut state = EngineState::Initializing;
    info!(%state, "fence engine starting");

    let cameras = cfg::load_fence_cameras(&cameras_path);
    if cameras.is_empty() {
        warn!(path = %cameras_path.display(), "no cameras with virtual fences found");
    }
    let pool = db::connect(&settings.db.engine_url(), 5)?;
    let mut engine = FenceEngine::new(
        cameras,
        settings.cooldown_seconds,
        settings.position_digits,
        RealClocks,
    );

    let topic = settings
        .mqtt
        .topic
        .clone()
        .unwrap_or_else(|| DEFAULT_TOPIC.to_owned());
    let qos = mqtt::qos(settings.mqtt.qos);
    let (client, mut eventloop) = mqtt::connect(&settings.mqtt, CLIENT_ID);
    info!(
        cameras = engine.camera_count(),
        %topic,
        "fence service started"
    );

    let mut last_evict = std::time::Instant::now();
    loop {
        let event = tokio::select! {
            _ = shutdown_rx.wait() => break,
            event = eventloop.poll() => event,
        };
        if last_evict.elapsed() >= EVICT_PERIOD {
            engine.evict_stale();
            last_evict = std::time::Instant::now();
        }
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if state != EngineState::Connected {
                    state = EngineState::Connected;
                    info!(%state, host = %settings.mqtt.host, port = settings.mqtt.port, "connected to MQTT broker");
                }
                // Subscriptions don't survive reconnects; renew on every CONNACK.
                if let Err(err) = client.subscribe(topic.as_str(), qos).await {
                    error!(%topic, %err, "failed to subscribe");
                } else {
                    info!(%topic, ?qos, "subscribed");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                for event in engine.evaluate(&publish.topic, &publish.payload) {
                    if let Err(err) = db::insert_event(&pool, &event).await {
                        error!(event = %event.id, %err, "failed to insert event");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "MQTT connection error, reconnecting");
                tokio::select! {
                    _ = sleep(RECONNECT_DELAY) => {}
                    _ = shutdown_rx.wait() => break,
                }
            }
        }
    }

    state = EngineState::Draining;
    info!(%state, "fence engine draining");
    let _ = client.disconnect().await;
    pool.close().await;
    state = EngineState::Stopped;
    info!(%state, "fence engine stopped");
    Ok(0)
}
