// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON wire payloads exchanged over MQTT.
//!
//! Detection envelopes are camelCase; the per-box entries inside them are
//! snake_case. Both shapes are fixed by the inference runners.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Per-frame detection message published on `vision/<camera_id>/detections`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMessage {
    #[serde(default)]
    pub camera_id: Option<String>,
    /// Carried on the wire but not consulted by fence evaluation.
    #[allow(dead_code)]
    #[serde(default)]
    pub model_id: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    pub model_name: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    pub frame_id: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

#[derive(Debug, Deserialize)]
pub struct Detection {
    #[allow(dead_code)]
    #[serde(default)]
    pub class_id: Option<i64>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub bbox: Vec<f64>,
}

/// Event message consumed from `vision/<camera_id>/events`.
///
/// Producers vary between snake_case and camelCase field names, so both are
/// accepted.
#[derive(Debug, Deserialize)]
pub struct EventMessage {
    pub id: String,
    #[serde(alias = "cameraId")]
    pub camera_id: String,
    #[serde(alias = "timestamp")]
    pub ts: String,
}

/// Parses an ISO-8601 timestamp, accepting a trailing `Z` or an explicit
/// offset. Absent or malformed values fall back to `now`.
pub fn parse_timestamp(value: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = value else { return now };
    let raw = raw.trim();
    if raw.is_empty() {
        return now;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => now,
    }
}

/// Extracts the camera id from a `vision/<camera_id>/detections`-shaped topic.
pub fn camera_id_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let head = parts.next()?;
    let camera = parts.next()?;
    let tail = parts.last()?;
    if head == "vision" && tail == "detections" && !camera.is_empty() {
        Some(camera)
    } else {
        None
    }
}
