// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand validating the catalogs and printing the expanded plan.

use std::path::PathBuf;

use anyhow::{bail, Error};
use bpaf::Bpaf;

use crate::cfg::{self, Settings};

/// Checks the camera/model catalogs and prints what would run.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the camera catalog, overriding `CAMERAS_JSON`.
    #[bpaf(long("cameras"), argument("PATH"))]
    cameras: Option<PathBuf>,

    /// Path to the model catalog, overriding `MODELS_JSON`.
    #[bpaf(long("models"), argument("PATH"))]
    models: Option<PathBuf>,
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

    let fence_cameras = cfg::load_fence_cameras(&cameras_path);
    println!("cameras with fences: {}", fence_cameras.len());
    let mut ids: Vec<_> = fence_cameras.keys().collect();
    ids.sort();
    for id in ids {
        let camera = &fence_cameras[id];
        println!(
            "  {} ({}x{}): {} fence(s)",
            id,
            camera.resolution.width,
            camera.resolution.height,
            camera.fences.len()
        );
        for fence in &camera.fences {
            let mut classes: Vec<_> = fence.detect_objects.iter().cloned().collect();
            classes.sort();
            println!(
                "    {}: {} points, detects [{}]",
                fence.name,
                fence.points.len(),
                classes.join(", ")
            );
        }
    }

    let record_cameras = cfg::load_record_cameras(
        &cameras_path,
        &settings.stream_host_internal,
        settings.stream_port_internal,
    );
    println!("cameras to record: {}", record_cameras.len());
    let mut ids: Vec<_> = record_cameras.keys().collect();
    ids.sort();
    for id in ids {
        let camera = &record_cameras[id];
        println!("  {} (stream {}) <- {}", id, camera.stream_id, camera.rtsp_url);
    }

    let plan = cfg::build_launch_plan(
        &cameras_path,
        &models_path,
        &settings.stream_host_internal,
        settings.stream_port_internal,
    );
    println!("launch plan: {} model(s)", plan.len());
    for entry in &plan {
        println!(
            "  {} ({} camera(s), runner {})",
            entry.model_id,
            entry.cameras.len(),
            entry.model.runner.display()
        );
        if !entry.model.runner.is_file() {
            println!("    WARNING: runner executable missing");
        }
        if let Some(class_file) = &entry.model.class_file {
            let classes = cfg::load_class_map(class_file);
            if classes.is_empty() {
                println!("    WARNING: class file {} is empty or missing", class_file.display());
            } else {
                println!("    {} classes from {}", classes.len(), class_file.display());
            }
        }
        for target in &entry.cameras {
            println!("    {}: {} -> {}", target.camera_id, target.input_url, target.output_url);
        }
    }
    Ok(0)
}
