// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand running the recorder app: per-camera segment recorders, the
//! pre-buffer recorders, and the event clipper fed from MQTT.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Error;
use base::shutdown;
use bpaf::Bpaf;
use rumqttc::{Event, Packet};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cfg::{self, Settings};
use crate::clipper::Clipper;
use crate::db;
use crate::msg::EventMessage;
use crate::mqtt;
use crate::prebuffer::BufferRecorder;
use crate::recorder::Recorder;

const CLIENT_ID: &str = "fenceline-record";
const DEFAULT_TOPIC: &str = "vision/+/events";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Records rolling segments and extracts pre/post event clips.
#[derive(Bpaf, Debug)]
#[bpaf(command("record"))]
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
    let cameras = cfg::load_record_cameras(
        &cameras_path,
        &settings.stream_host_internal,
        settings.stream_port_internal,
    );
    if cameras.is_empty() {
        warn!(path = %cameras_path.display(), "no cameras enabled for recording");
    }

    let pool = match settings.db.recorder_url() {
        None => {
            warn!("database not fully configured; thumbnail updates disabled");
            None
        }
        Some(url) => match db::connect(&url, 3) {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(%err, "unable to set up database pool; thumbnail updates disabled");
                None
            }
        },
    };

    let mut workers = Vec::new();
    for camera in cameras.values() {
        info!(camera = %camera.camera_id, url = %camera.rtsp_url, "starting recorder");
        workers.push(tokio::spawn(
            Recorder {
                camera: camera.clone(),
                recordings_dir: settings.recordings_dir.clone(),
                segment_seconds: settings.segment_seconds,
                postprocess_faststart: settings.postprocess_faststart,
                postprocess_remux_mp4: settings.postprocess_remux_mp4,
                postprocess_stable_seconds: settings.postprocess_stable_seconds,
                shutdown_rx: shutdown_rx.clone(),
            }
            .run(),
        ));
        if settings.buffer_enabled {
            workers.push(tokio::spawn(
                BufferRecorder {
                    camera: camera.clone(),
                    buffer_dir: settings.buffer_dir.clone(),
                    segment_seconds: settings.buffer_segment_seconds,
                    retention_seconds: settings.buffer_retention_seconds(),
                    reencode: settings.buffer_reencode,
                    gop: settings.buffer_gop,
                    shutdown_rx: shutdown_rx.clone(),
                }
                .run(),
            ));
        }
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel::<EventMessage>();
    workers.push(tokio::spawn(
        Clipper {
            settings: settings.clone(),
            cameras,
            pool,
            shutdown_rx: shutdown_rx.clone(),
        }
        .run(event_rx),
    ));

    // Feed the clipper from the event topic on this task.
    let topic = settings
        .mqtt
        .topic
        .clone()
        .unwrap_or_else(|| DEFAULT_TOPIC.to_owned());
    let qos = mqtt::qos(settings.mqtt.qos);
    let (client, mut eventloop) = mqtt::connect(&settings.mqtt, CLIENT_ID);
    info!(%topic, "recorder app started");

    loop {
        tokio::select! {
            _ = shutdown_rx.wait() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(host = %settings.mqtt.host, port = settings.mqtt.port, "connected to MQTT, subscribing");
                    if let Err(err) = client.subscribe(topic.as_str(), qos).await {
                        warn!(%topic, %err, "failed to subscribe");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match serde_json::from_slice::<EventMessage>(&publish.payload) {
                        Ok(message) => {
                            if event_tx.send(message).is_err() {
                                warn!("clipper queue closed, dropping event");
                            }
                        }
                        Err(err) => {
                            warn!(topic = %publish.topic, %err, "skipping event payload with missing fields");
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
    }

    info!("shutting down recorders");
    let _ = client.disconnect().await;
    drop(event_tx);
    for worker in workers {
        let _ = worker.await;
    }
    info!("recorder app stopped");
    Ok(0)
}
