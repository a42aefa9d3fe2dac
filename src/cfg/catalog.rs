// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The camera and model catalogs (`cameras.json`, `models.json`).
//!
//! Catalog problems are never fatal to a running service: malformed cameras,
//! fences, and models are logged and skipped, and a missing or unparseable
//! file yields an empty set. The launcher treats an empty plan as a startup
//! failure, but that decision lives with the caller.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::streams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A fence that survived load-time validation: ≥3 points, all normalized,
/// non-empty (case-folded) detect set.
#[derive(Debug, Clone)]
pub struct VirtualFence {
    pub name: String,
    pub points: Vec<(f64, f64)>,
    pub detect_objects: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct FenceCamera {
    pub camera_id: String,
    pub resolution: Resolution,
    pub fences: Vec<VirtualFence>,
}

/// A camera as the recorder sees it: just an id and a pullable URL.
#[derive(Debug, Clone)]
pub struct RecordCamera {
    pub camera_id: String,
    pub stream_id: String,
    pub rtsp_url: String,
}

#[derive(Debug, Deserialize)]
struct CamerasFile {
    #[serde(default)]
    cameras: Vec<RawCamera>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCamera {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    stream_url: Option<String>,
    #[serde(default)]
    rtsp_url: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default, rename = "modelID")]
    model_id: Option<String>,
    #[serde(default)]
    virtual_fences: Vec<RawFence>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFence {
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    points: Vec<RawPoint>,
    #[serde(default)]
    detect_objects: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawPoint {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

/// A model catalog entry, unvalidated.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,
    #[serde(default)]
    pub weights: Option<PathBuf>,
    #[serde(default)]
    pub runner: Option<PathBuf>,
    #[serde(default, rename = "inputSize")]
    pub input_size: Vec<i64>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub class_file: Option<PathBuf>,
}

/// A model entry that passed validation and can be launched.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub name: String,
    pub weights: PathBuf,
    pub runner: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub device: Option<String>,
    pub class_file: Option<PathBuf>,
}

/// One camera endpoint inside a launch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerTarget {
    pub camera_id: String,
    pub input_url: String,
    pub output_url: String,
}

/// One (model, cameras) group of the expanded launch plan.
#[derive(Debug, Clone)]
pub struct LaunchEntry {
    pub model_id: String,
    pub model: ResolvedModel,
    pub cameras: Vec<RunnerTarget>,
}

fn default_true() -> bool {
    true
}

fn read_catalog<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(err) => {
            warn!(path = %path.display(), %err, "unable to read {what}");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(path = %path.display(), %err, "unable to parse {what}");
            None
        }
    }
}

/// Parses a `WxH` resolution string; lowercase and surrounding whitespace are
/// tolerated.
pub fn parse_resolution(resolution: &str) -> Option<Resolution> {
    let (w, h) = resolution.to_ascii_lowercase().split_once('x').map(|(w, h)| {
        (w.trim().to_owned(), h.trim().to_owned())
    })?;
    let width: u32 = w.parse().ok()?;
    let height: u32 = h.parse().ok()?;
    if width > 0 && height > 0 {
        Some(Resolution { width, height })
    } else {
        None
    }
}

/// Normalizes polygon points to [0,1]². Points are taken as already
/// normalized when every coordinate lies in [0,1]; otherwise they are divided
/// by the camera resolution. Either way the result is clamped.
pub fn normalize_points(points: &[RawPoint], resolution: Resolution) -> Vec<(f64, f64)> {
    let looks_normalized = points
        .iter()
        .all(|p| (0.0..=1.0).contains(&p.x) && (0.0..=1.0).contains(&p.y));
    points
        .iter()
        .map(|p| {
            let (mut x, mut y) = (p.x, p.y);
            if !looks_normalized {
                x /= f64::from(resolution.width);
                y /= f64::from(resolution.height);
            }
            (x.clamp(0.0, 1.0), y.clamp(0.0, 1.0))
        })
        .collect()
}

/// Loads the cameras that have at least one usable virtual fence.
pub fn load_fence_cameras(path: &Path) -> HashMap<String, FenceCamera> {
    let Some(file) = read_catalog::<CamerasFile>(path, "camera catalog") else {
        return HashMap::new();
    };
    let mut map = HashMap::new();
    for camera in file.cameras {
        let Some(camera_id) = camera.id.filter(|id| !id.is_empty()) else {
            continue;
        };
        if camera.virtual_fences.is_empty() {
            continue;
        }
        let Some(resolution) = camera.resolution.as_deref().and_then(parse_resolution) else {
            warn!(camera = %camera_id, "missing valid resolution, skipping fences");
            continue;
        };
        let mut fences = Vec::new();
        for fence in camera.virtual_fences {
            let name = fence.name.unwrap_or_else(|| "Zone".to_owned());
            if !fence.enabled {
                continue;
            }
            let points = normalize_points(&fence.points, resolution);
            if points.len() < 3 {
                warn!(camera = %camera_id, fence = %name, "ignoring fence with <3 points");
                continue;
            }
            let detect_objects: HashSet<String> = fence
                .detect_objects
                .iter()
                .filter(|o| !o.is_empty())
                .map(|o| o.to_lowercase())
                .collect();
            if detect_objects.is_empty() {
                warn!(camera = %camera_id, fence = %name, "ignoring fence with empty detectObjects");
                continue;
            }
            fences.push(VirtualFence {
                name,
                points,
                detect_objects,
            });
        }
        if !fences.is_empty() {
            info!(camera = %camera_id, fences = fences.len(), "loaded fences");
            map.insert(
                camera_id.clone(),
                FenceCamera {
                    camera_id,
                    resolution,
                    fences,
                },
            );
        }
    }
    map
}

/// Loads the enabled cameras a recorder should pull, resolving each to a URL
/// reachable from inside the deployment. Overlay restreams are skipped: they
/// are derived outputs, not sources worth archiving.
pub fn load_record_cameras(
    path: &Path,
    stream_host: &str,
    stream_port: u16,
) -> HashMap<String, RecordCamera> {
    let Some(file) = read_catalog::<CamerasFile>(path, "camera catalog") else {
        return HashMap::new();
    };
    let mut map = HashMap::new();
    for camera in file.cameras {
        if !camera.enabled {
            continue;
        }
        let Some(camera_id) = camera.id.filter(|id| !id.is_empty()) else {
            continue;
        };
        let stream_id = camera
            .stream_url
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| camera_id.clone());
        if camera_id.ends_with("overlay") || stream_id.ends_with("overlay") {
            continue;
        }
        let rtsp_url = streams::record_url(
            stream_host,
            stream_port,
            &stream_id,
            camera.rtsp_url.as_deref(),
        );
        map.insert(
            camera_id.clone(),
            RecordCamera {
                camera_id,
                stream_id,
                rtsp_url,
            },
        );
    }
    map
}

/// Loads the raw model catalog.
pub fn load_models(path: &Path) -> Vec<ModelEntry> {
    read_catalog::<ModelsFile>(path, "model catalog")
        .map(|f| f.models)
        .unwrap_or_default()
}

/// Lowercases and squeezes every non-alphanumeric run to a single `_`,
/// trimming leading/trailing separators.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Match candidates for one model: name, weights stem, and type, each in
/// lowercase and slug form.
fn candidates(model: &ModelEntry) -> Vec<String> {
    let mut set = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !set.contains(&s) {
            set.push(s);
        }
    };
    if let Some(name) = &model.name {
        push(name.to_lowercase());
        push(slugify(name));
    }
    if let Some(stem) = model
        .weights
        .as_deref()
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
    {
        push(stem.to_lowercase());
        push(slugify(stem));
    }
    if let Some(t) = &model.model_type {
        push(t.to_lowercase());
    }
    set
}

/// Finds the model a camera's `modelID` refers to: exact lowercase/slug match
/// or prefix containment in either direction; first match wins.
fn match_model<'a>(model_id: &str, indexed: &'a [(ModelEntry, Vec<String>)]) -> Option<&'a ModelEntry> {
    let target_slug = slugify(model_id);
    let target_lower = model_id.to_lowercase();
    if target_slug.is_empty() {
        return None;
    }
    for (model, cands) in indexed {
        for candidate in cands {
            if target_lower == *candidate
                || target_slug == *candidate
                || candidate.starts_with(&target_slug)
                || target_slug.starts_with(candidate.as_str())
            {
                return Some(model);
            }
        }
    }
    None
}

fn resolve_model(model_id: &str, model: &ModelEntry) -> Option<ResolvedModel> {
    let Some(runner) = model.runner.clone() else {
        warn!(model = %model_id, "missing runner path, skipping");
        return None;
    };
    let Some(weights) = model.weights.clone() else {
        warn!(model = %model_id, "missing weights path, skipping");
        return None;
    };
    let (input_width, input_height) = match model.input_size.as_slice() {
        [w, h, ..] if *w > 0 && *h > 0 => (*w as u32, *h as u32),
        [] => (640, 640),
        _ => {
            warn!(model = %model_id, "invalid inputSize, using default 640x640");
            (640, 640)
        }
    };
    Some(ResolvedModel {
        name: model
            .name
            .clone()
            .unwrap_or_else(|| model_id.to_owned()),
        weights,
        runner,
        input_width,
        input_height,
        device: model.device.clone(),
        class_file: model.class_file.clone(),
    })
}

/// Expands the camera×model configuration into the launch plan: one entry per
/// referenced model, each carrying the cameras to serve with rewritten
/// input/output URLs.
pub fn build_launch_plan(
    cameras_path: &Path,
    models_path: &Path,
    stream_host: &str,
    stream_port: u16,
) -> Vec<LaunchEntry> {
    let Some(file) = read_catalog::<CamerasFile>(cameras_path, "camera catalog") else {
        return Vec::new();
    };

    // Group cameras by modelID, preserving catalog order.
    let mut groups: Vec<(String, Vec<RunnerTarget>)> = Vec::new();
    for camera in file.cameras {
        if !camera.enabled {
            continue;
        }
        let Some(model_id) = camera.model_id.filter(|m| !m.is_empty()) else {
            continue;
        };
        let camera_id = camera
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "unknown".to_owned());
        let Some(rtsp_in) = camera.rtsp_url.filter(|u| !u.is_empty()) else {
            continue;
        };
        let input_url = streams::rewrite_internal(&rtsp_in, stream_host, stream_port);
        let output_url = streams::overlay_url(&input_url);
        let target = RunnerTarget {
            camera_id,
            input_url,
            output_url,
        };
        match groups.iter_mut().find(|(id, _)| *id == model_id) {
            Some((_, targets)) => targets.push(target),
            None => groups.push((model_id, vec![target])),
        }
    }
    if groups.is_empty() {
        info!("no cameras require a model, nothing to launch");
        return Vec::new();
    }

    let indexed: Vec<(ModelEntry, Vec<String>)> = load_models(models_path)
        .into_iter()
        .map(|m| {
            let c = candidates(&m);
            (m, c)
        })
        .collect();

    let mut plan = Vec::new();
    for (model_id, cameras) in groups {
        let Some(entry) = match_model(&model_id, &indexed) else {
            warn!(
                model = %model_id,
                cameras = ?cameras.iter().map(|c| c.camera_id.as_str()).collect::<Vec<_>>(),
                "modelID referenced by cameras not found in model catalog"
            );
            continue;
        };
        let Some(model) = resolve_model(&model_id, entry) else {
            continue;
        };
        plan.push(LaunchEntry {
            model_id,
            model,
            cameras,
        });
    }
    plan
}

/// Parses a YOLO-style class name file: a `names:` line opens the block, then
/// `<int>: <name>` lines (sparse ids allowed).
pub fn load_class_map(path: &Path) -> HashMap<i64, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        warn!(path = %path.display(), "class file not found");
        return map;
    };
    let mut in_names = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("names:") {
            in_names = true;
            continue;
        }
        if !in_names {
            continue;
        }
        let Some((id, name)) = line.split_once(':') else {
            continue;
        };
        let Ok(id) = id.trim().parse::<i64>() else {
            continue;
        };
        let name = name.trim();
        if !name.is_empty() {
            map.insert(id, name.to_owned());
        }
    }
    map
}
