// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand expanding the camera×model plan into a supervised fleet of
//! inference runner processes.
//!
//! A runner that exits is logged with its code but not restarted here;
//! restart policy belongs to the outer orchestrator.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Error};
use base::shutdown;
use bpaf::Bpaf;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::cfg::{self, MqttSettings, ResolvedModel, RunnerTarget, Settings};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Launches one inference runner per (model, camera) pair.
#[derive(Bpaf, Debug)]
#[bpaf(command("launch"))]
pub struct Args {
    /// Path to the camera catalog, overriding `CAMERAS_JSON`.
    #[bpaf(long("cameras"), argument("PATH"))]
    cameras: Option<PathBuf>,

    /// Path to the model catalog, overriding `MODELS_JSON`.
    #[bpaf(long("models"), argument("PATH"))]
    models: Option<PathBuf>,
}

/// One supervised runner child, keyed by (model, camera).
struct Runner {
    model_id: String,
    camera_id: String,
    child: Child,
    args: Vec<String>,
    started_at: Instant,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let settings = Settings::from_env();
    let cameras_path = args.cameras.unwrap_or_else(|| settings.cameras_json.clone());
    let models_path = args.models.unwrap_or_else(|| settings.models_json.clone());
    if !cameras_path.is_file() {
        bail!("camera catalog not found at {}", cameras_path.display());
    }
    if !models_path.is_file() {
        bail!("model catalog not found at {}", models_path.display());
    }
    super::run_with_shutdown(|shutdown_rx| inner(settings, cameras_path, models_path, shutdown_rx))
}

/// Command-line arguments handed to one runner process.
pub fn runner_args(
    model_id: &str,
    model: &ResolvedModel,
    target: &RunnerTarget,
    mqtt: &MqttSettings,
) -> Vec<String> {
    let mut args = vec![
        "--weights".to_owned(),
        model.weights.to_string_lossy().into_owned(),
        "--input-width".to_owned(),
        model.input_width.to_string(),
        "--input-height".to_owned(),
        model.input_height.to_string(),
        "--model-name".to_owned(),
        model.name.clone(),
        "--model-id".to_owned(),
        model_id.to_owned(),
        "--cameras".to_owned(),
        target.camera_id.clone(),
        "--input-url".to_owned(),
        target.input_url.clone(),
        "--output-url".to_owned(),
        target.output_url.clone(),
    ];
    if let Some(device) = &model.device {
        args.push("--device".to_owned());
        args.push(device.clone());
    }
    if let Some(class_file) = &model.class_file {
        args.push("--class-file".to_owned());
        args.push(class_file.to_string_lossy().into_owned());
    }
    args.push("--mqtt-host".to_owned());
    args.push(mqtt.host.clone());
    args.push("--mqtt-port".to_owned());
    args.push(mqtt.port.to_string());
    if let Some(topic) = &mqtt.topic {
        args.push("--mqtt-topic".to_owned());
        args.push(topic.clone());
    }
    if let Some(username) = &mqtt.username {
        args.push("--mqtt-username".to_owned());
        args.push(username.clone());
        if let Some(password) = &mqtt.password {
            args.push("--mqtt-password".to_owned());
            args.push(password.clone());
        }
    }
    args.push("--mqtt-qos".to_owned());
    args.push(mqtt.qos.to_string());
    args
}

async fn inner(
    settings: Settings,
    cameras_path: PathBuf,
    models_path: PathBuf,
    shutdown_rx: shutdown::Receiver,
) -> Result<i32, Error> {
    let plan = cfg::build_launch_plan(
        &cameras_path,
        &models_path,
        &settings.stream_host_internal,
        settings.stream_port_internal,
    );
    if plan.is_empty() {
        bail!("no runnable camera×model pairs in the catalogs");
    }

    let mut runners = Vec::new();
    for entry in &plan {
        if !entry.model.runner.is_file() {
            warn!(
                model = %entry.model_id,
                runner = %entry.model.runner.display(),
                "runner executable not found, skipping model"
            );
            continue;
        }
        for target in &entry.cameras {
            let args = runner_args(&entry.model_id, &entry.model, target, &settings.mqtt);
            info!(
                model = %entry.model_id,
                camera = %target.camera_id,
                runner = %entry.model.runner.display(),
                "starting runner"
            );
            match Command::new(&entry.model.runner)
                .args(&args)
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => runners.push(Runner {
                    model_id: entry.model_id.clone(),
                    camera_id: target.camera_id.clone(),
                    child,
                    args,
                    started_at: Instant::now(),
                }),
                Err(err) => {
                    error!(
                        model = %entry.model_id,
                        camera = %target.camera_id,
                        %err,
                        "failed to start runner"
                    );
                }
            }
        }
    }
    if runners.is_empty() {
        bail!("no runner processes were launched");
    }
    info!(count = runners.len(), "runner fleet launched");

    let mut watchers = Vec::new();
    for runner in runners {
        watchers.push(tokio::spawn(watch_runner(runner, shutdown_rx.clone())));
    }
    for watcher in watchers {
        let _ = watcher.await;
    }
    info!("all runner processes exited");
    Ok(0)
}

/// Waits for one runner to exit (logging its code) or stops it on shutdown.
async fn watch_runner(mut runner: Runner, shutdown_rx: shutdown::Receiver) {
    let status = tokio::select! {
        status = runner.child.wait() => Some(status),
        _ = shutdown_rx.wait() => None,
    };
    match status {
        Some(Ok(status)) => warn!(
            model = %runner.model_id,
            camera = %runner.camera_id,
            code = status.code(),
            uptime_secs = runner.started_at.elapsed().as_secs(),
            args = ?runner.args,
            "runner exited"
        ),
        Some(Err(err)) => error!(
            model = %runner.model_id,
            camera = %runner.camera_id,
            %err,
            "failed to reap runner"
        ),
        None => {
            info!(model = %runner.model_id, camera = %runner.camera_id, "stopping runner");
            stop_runner(&mut runner.child).await;
        }
    }
}

/// SIGTERM, a bounded wait, then SIGKILL.
async fn stop_runner(child: &mut Child) {
    let Some(pid) = child.id() else { return };
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!("runner ignored SIGTERM, killing");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ResolvedModel {
        ResolvedModel {
            name: "YOLOv8 V1".to_owned(),
            weights: "/models/yolov8n.pt".into(),
            runner: "/opt/runners/yolov8_inference".into(),
            input_width: 640,
            input_height: 640,
            device: Some("cuda:0".to_owned()),
            class_file: Some("/models/classes.txt".into()),
        }
    }

    fn target() -> RunnerTarget {
        RunnerTarget {
            camera_id: "camA".to_owned(),
            input_url: "rtsp://go2rtc:8554/camA_raw".to_owned(),
            output_url: "rtsp://go2rtc:8554/camAoverlay".to_owned(),
        }
    }

    #[test]
    fn runner_args_cover_model_and_endpoints() {
        let mqtt = MqttSettings {
            host: "mqtt".to_owned(),
            port: 1883,
            topic: None,
            username: None,
            password: None,
            qos: 1,
        };
        let args = runner_args("yolov8", &model(), &target(), &mqtt);
        let joined = args.join(" ");
        assert!(joined.starts_with("--weights /models/yolov8n.pt"));
        assert!(joined.contains("--input-width 640 --input-height 640"));
        assert!(joined.contains("--model-name YOLOv8 V1 --model-id yolov8"));
        assert!(joined.contains("--cameras camA"));
        assert!(joined.contains("--input-url rtsp://go2rtc:8554/camA_raw"));
        assert!(joined.contains("--output-url rtsp://go2rtc:8554/camAoverlay"));
        assert!(joined.contains("--device cuda:0"));
        assert!(joined.contains("--class-file /models/classes.txt"));
        assert!(joined.contains("--mqtt-host mqtt --mqtt-port 1883"));
        assert!(joined.ends_with("--mqtt-qos 1"));
        assert!(!joined.contains("--mqtt-username"));
    }

    #[test]
    fn runner_args_pass_credentials_together() {
        let mqtt = MqttSettings {
            host: "mqtt".to_owned(),
            port: 1883,
            topic: Some("vision/camA/detections".to_owned()),
            username: Some("vision".to_owned()),
            password: Some("secret".to_owned()),
            qos: 0,
        };
        let args = runner_args("yolov8", &model(), &target(), &mqtt);
        let joined = args.join(" ");
        assert!(joined.contains("--mqtt-topic vision/camA/detections"));
        assert!(joined.contains("--mqtt-username vision --mqtt-password secret"));
    }
}
