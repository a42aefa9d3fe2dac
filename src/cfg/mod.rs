// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Configuration: the camera/model catalogs and the environment settings.

mod catalog;
mod settings;

pub use catalog::{
    build_launch_plan, load_class_map, load_fence_cameras, load_models, load_record_cameras,
    normalize_points, parse_resolution, slugify, FenceCamera, LaunchEntry, ModelEntry,
    RawPoint, RecordCamera, Resolution, ResolvedModel, RunnerTarget, VirtualFence,
};
pub use settings::{DbSettings, MqttSettings, Settings};
