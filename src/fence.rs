// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Virtual fence evaluation: maps detections to normalized centers, tests
//! them against per-camera polygons, and deduplicates triggers with a
//! cooldown keyed on the quantized center position.

use std::collections::HashMap;

use base::clock::Clocks;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::cfg::{FenceCamera, Resolution};
use crate::db::{self, Event};
use crate::msg::{self, Detection, DetectionMessage};

/// Coordinate space of a bounding box, inferred by range: all four values in
/// [0,1] means normalized, anything else is pixel space relative to the
/// camera's declared resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordSpace {
    Normalized,
    Pixel { width: u32, height: u32 },
}

pub fn classify_bbox(bbox: &[f64; 4], resolution: Resolution) -> CoordSpace {
    if bbox.iter().all(|v| (0.0..=1.0).contains(v)) {
        CoordSpace::Normalized
    } else {
        CoordSpace::Pixel {
            width: resolution.width,
            height: resolution.height,
        }
    }
}

/// The bbox center in normalized coordinates, clamped to [0,1]².
pub fn normalized_center(bbox: &[f64; 4], space: CoordSpace) -> Option<(f64, f64)> {
    let mut cx = (bbox[0] + bbox[2]) / 2.0;
    let mut cy = (bbox[1] + bbox[3]) / 2.0;
    if let CoordSpace::Pixel { width, height } = space {
        if width == 0 || height == 0 {
            return None;
        }
        cx /= f64::from(width);
        cy /= f64::from(height);
    }
    Some((cx.clamp(0.0, 1.0), cy.clamp(0.0, 1.0)))
}

/// Ray casting over a normalized polygon. Strict comparisons throughout, so
/// behavior exactly on an edge or vertex is unspecified but deterministic.
pub fn point_in_polygon(x: f64, y: f64, polygon: &[(f64, f64)]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) {
            let mut dy = yj - yi;
            if dy == 0.0 {
                dy = 1e-9;
            }
            if x < (xj - xi) * (y - yi) / dy + xi {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Lifecycle of the engine service, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Connected,
    Draining,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EngineState::Initializing => "initializing",
            EngineState::Connected => "connected",
            EngineState::Draining => "draining",
            EngineState::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    camera_id: String,
    fence_name: String,
    class_name: String,
    qx: i64,
    qy: i64,
}

/// Suppresses repeated events from a near-stationary object: at most one
/// admission per key per cooldown window.
pub struct CooldownTable {
    cooldown: TimeDelta,
    scale: f64,
    last: HashMap<CooldownKey, DateTime<Utc>>,
}

impl CooldownTable {
    pub fn new(cooldown_seconds: f64, position_digits: u32) -> Self {
        CooldownTable {
            cooldown: TimeDelta::milliseconds((cooldown_seconds * 1000.0) as i64),
            scale: 10f64.powi(position_digits as i32),
            last: HashMap::new(),
        }
    }

    pub fn admit(
        &mut self,
        camera_id: &str,
        fence_name: &str,
        class_name: &str,
        center: (f64, f64),
        now: DateTime<Utc>,
    ) -> bool {
        let key = CooldownKey {
            camera_id: camera_id.to_owned(),
            fence_name: fence_name.to_owned(),
            class_name: class_name.to_owned(),
            qx: (center.0 * self.scale).round() as i64,
            qy: (center.1 * self.scale).round() as i64,
        };
        if let Some(last) = self.last.get(&key) {
            if now - *last < self.cooldown {
                return false;
            }
        }
        self.last.insert(key, now);
        true
    }

    /// Drops keys idle long enough that they can never suppress again. The
    /// table is otherwise unbounded.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) {
        let horizon = self.cooldown * 10;
        self.last.retain(|_, last| now - *last < horizon);
    }
}

/// Evaluates detection messages against the loaded fences.
///
/// The engine owns the cooldown table; persistence of the returned events is
/// the caller's concern so that a database hiccup never stalls evaluation.
pub struct FenceEngine<C: Clocks> {
    cameras: HashMap<String, FenceCamera>,
    cooldown: CooldownTable,
    clocks: C,
}

impl<C: Clocks> FenceEngine<C> {
    pub fn new(
        cameras: HashMap<String, FenceCamera>,
        cooldown_seconds: f64,
        position_digits: u32,
        clocks: C,
    ) -> Self {
        FenceEngine {
            cameras,
            cooldown: CooldownTable::new(cooldown_seconds, position_digits),
            clocks,
        }
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    /// Processes one detection publish, returning the admitted events.
    pub fn evaluate(&mut self, topic: &str, payload: &[u8]) -> Vec<Event> {
        let message: DetectionMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(err) => {
                warn!(%topic, %err, "dropping invalid detection JSON");
                return Vec::new();
            }
        };
        let camera_id = message
            .camera_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| msg::camera_id_from_topic(topic));
        let Some(camera_id) = camera_id else {
            return Vec::new();
        };
        let Some(camera) = self.cameras.get(camera_id) else {
            debug!(camera = %camera_id, "no fences configured, ignoring");
            return Vec::new();
        };
        if message.detections.is_empty() {
            return Vec::new();
        }
        let camera = camera.clone();
        let ts = msg::parse_timestamp(message.timestamp.as_deref(), self.clocks.now());
        let mut events = Vec::new();
        for detection in &message.detections {
            self.evaluate_detection(&camera, detection, ts, &mut events);
        }
        events
    }

    fn evaluate_detection(
        &mut self,
        camera: &FenceCamera,
        detection: &Detection,
        ts: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) {
        let Ok(bbox) = <[f64; 4]>::try_from(detection.bbox.as_slice()) else {
            return;
        };
        let Some(class_name) = detection.class_name.as_deref().filter(|c| !c.is_empty()) else {
            return;
        };
        let space = classify_bbox(&bbox, camera.resolution);
        let Some(center) = normalized_center(&bbox, space) else {
            return;
        };
        let folded_class = class_name.to_lowercase();

        for fence in &camera.fences {
            if !fence.detect_objects.contains(&folded_class) {
                continue;
            }
            if !point_in_polygon(center.0, center.1, &fence.points) {
                continue;
            }
            let now = self.clocks.now();
            if !self.cooldown.admit(
                &camera.camera_id,
                &fence.name,
                &folded_class,
                center,
                now,
            ) {
                continue;
            }
            info!(
                fence = %fence.name,
                camera = %camera.camera_id,
                class = %class_name,
                score = detection.score.unwrap_or(-1.0),
                "fence triggered"
            );
            events.push(Event {
                id: db::new_event_id(),
                camera_id: camera.camera_id.clone(),
                class_name: class_name.to_owned(),
                ts,
                score: detection.score,
            });
        }
    }

    /// Periodic maintenance; see [`CooldownTable::evict_stale`].
    pub fn evict_stale(&mut self) {
        let now = self.clocks.now();
        self.cooldown.evict_stale(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use std::collections::HashSet;
    use std::time::Duration;

    use crate::cfg::VirtualFence;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn triangle() -> Vec<(f64, f64)> {
        vec![(0.2, 0.2), (0.8, 0.2), (0.5, 0.8)]
    }

    #[test]
    fn triangle_inside_outside() {
        assert!(point_in_polygon(0.5, 0.3, &triangle()));
        assert!(!point_in_polygon(0.1, 0.3, &triangle()));
    }

    #[test]
    fn vertex_is_stable() {
        let first = point_in_polygon(0.2, 0.2, &triangle());
        for _ in 0..10 {
            assert_eq!(point_in_polygon(0.2, 0.2, &triangle()), first);
        }
    }

    #[test]
    fn degenerate_polygon_is_never_inside() {
        assert!(!point_in_polygon(0.5, 0.5, &[(0.0, 0.0), (1.0, 1.0)]));
    }

    #[test]
    fn pixel_bbox_center() {
        let res = Resolution {
            width: 1920,
            height: 1080,
        };
        let bbox = [960.0, 540.0, 1920.0, 1080.0];
        let space = classify_bbox(&bbox, res);
        assert_eq!(
            space,
            CoordSpace::Pixel {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(normalized_center(&bbox, space), Some((0.75, 0.75)));
    }

    #[test]
    fn mixed_range_bbox_is_pixel_space() {
        let res = Resolution {
            width: 1920,
            height: 1080,
        };
        let bbox = [0.5, 0.5, 1600.0, 900.0];
        assert_eq!(
            classify_bbox(&bbox, res),
            CoordSpace::Pixel {
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn normalized_bbox_keeps_coordinates() {
        let res = Resolution {
            width: 1920,
            height: 1080,
        };
        let bbox = [0.25, 0.25, 0.75, 0.75];
        let space = classify_bbox(&bbox, res);
        assert_eq!(space, CoordSpace::Normalized);
        assert_eq!(normalized_center(&bbox, space), Some((0.5, 0.5)));
    }

    #[test]
    fn center_is_clamped() {
        let res = Resolution {
            width: 100,
            height: 100,
        };
        let bbox = [-50.0, -50.0, 400.0, 400.0];
        let space = classify_bbox(&bbox, res);
        let (cx, cy) = normalized_center(&bbox, space).unwrap();
        assert!((0.0..=1.0).contains(&cx));
        assert!((0.0..=1.0).contains(&cy));
    }

    #[test]
    fn cooldown_admits_once_per_window() {
        let mut table = CooldownTable::new(30.0, 2);
        let t0 = at("2025-01-30T10:00:00Z");
        assert!(table.admit("camA", "Zone1", "person", (0.5, 0.5), t0));
        assert!(!table.admit(
            "camA",
            "Zone1",
            "person",
            (0.5, 0.5),
            t0 + TimeDelta::seconds(5)
        ));
        assert!(table.admit(
            "camA",
            "Zone1",
            "person",
            (0.5, 0.5),
            t0 + TimeDelta::seconds(30)
        ));
    }

    #[test]
    fn cooldown_distinguishes_quantized_positions() {
        let mut table = CooldownTable::new(30.0, 2);
        let t0 = at("2025-01-30T10:00:00Z");
        assert!(table.admit("camA", "Zone1", "person", (0.500, 0.500), t0));
        // Rounds to the same 2-digit cell: suppressed.
        assert!(!table.admit("camA", "Zone1", "person", (0.501, 0.499), t0));
        // A different cell is an independent key.
        assert!(table.admit("camA", "Zone1", "person", (0.52, 0.50), t0));
    }

    #[test]
    fn cooldown_eviction_drops_idle_keys() {
        let mut table = CooldownTable::new(30.0, 2);
        let t0 = at("2025-01-30T10:00:00Z");
        table.admit("camA", "Zone1", "person", (0.5, 0.5), t0);
        table.evict_stale(t0 + TimeDelta::seconds(100));
        assert_eq!(table.last.len(), 1);
        table.evict_stale(t0 + TimeDelta::seconds(301));
        assert!(table.last.is_empty());
    }

    fn test_camera() -> HashMap<String, FenceCamera> {
        let mut detect = HashSet::new();
        detect.insert("person".to_owned());
        let mut cameras = HashMap::new();
        cameras.insert(
            "camA".to_owned(),
            FenceCamera {
                camera_id: "camA".to_owned(),
                resolution: Resolution {
                    width: 1280,
                    height: 720,
                },
                fences: vec![VirtualFence {
                    name: "Zone1".to_owned(),
                    points: vec![(0.1, 0.1), (0.9, 0.1), (0.9, 0.9), (0.1, 0.9)],
                    detect_objects: detect,
                }],
            },
        );
        cameras
    }

    fn engine(clocks: SimulatedClocks) -> FenceEngine<SimulatedClocks> {
        FenceEngine::new(test_camera(), 30.0, 2, clocks)
    }

    const DETECTION: &[u8] = br#"{
        "cameraId": "camA",
        "timestamp": "2025-01-30T10:15:00Z",
        "detections": [
            {"class_name": "Person", "score": 0.9, "bbox": [320.0, 180.0, 960.0, 540.0]}
        ]
    }"#;

    #[test]
    fn admit_then_suppress_within_cooldown() {
        let clocks = SimulatedClocks::new(at("2025-01-30T10:15:00Z"));
        let mut engine = engine(clocks.clone());

        let events = engine.evaluate("vision/camA/detections", DETECTION);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.id.starts_with("evt_"));
        assert_eq!(event.camera_id, "camA");
        assert_eq!(event.class_name, "Person");
        assert_eq!(event.ts, at("2025-01-30T10:15:00Z"));
        assert_eq!(event.score, Some(0.9));

        clocks.sleep(Duration::from_secs(5));
        assert!(engine
            .evaluate("vision/camA/detections", DETECTION)
            .is_empty());

        clocks.sleep(Duration::from_secs(25));
        assert_eq!(engine.evaluate("vision/camA/detections", DETECTION).len(), 1);
    }

    #[test]
    fn unknown_camera_is_ignored() {
        let clocks = SimulatedClocks::new(at("2025-01-30T10:15:00Z"));
        let mut engine = engine(clocks);
        let payload = br#"{"detections": [{"class_name": "person", "bbox": [0.4, 0.4, 0.6, 0.6]}]}"#;
        assert!(engine
            .evaluate("vision/unknown/detections", payload)
            .is_empty());
    }

    #[test]
    fn camera_id_falls_back_to_topic() {
        let clocks = SimulatedClocks::new(at("2025-01-30T10:15:00Z"));
        let mut engine = engine(clocks);
        let payload = br#"{"detections": [{"class_name": "person", "bbox": [0.4, 0.4, 0.6, 0.6]}]}"#;
        assert_eq!(engine.evaluate("vision/camA/detections", payload).len(), 1);
    }

    #[test]
    fn missing_timestamp_uses_clock() {
        let now = at("2025-06-01T00:00:00Z");
        let clocks = SimulatedClocks::new(now);
        let mut engine = engine(clocks);
        let payload = br#"{"cameraId": "camA", "detections": [{"class_name": "person", "bbox": [0.4, 0.4, 0.6, 0.6]}]}"#;
        let events = engine.evaluate("vision/camA/detections", payload);
        assert_eq!(events[0].ts, now);
    }

    #[test]
    fn invalid_json_and_bad_bboxes_drop() {
        let clocks = SimulatedClocks::new(at("2025-01-30T10:15:00Z"));
        let mut engine = engine(clocks);
        assert!(engine
            .evaluate("vision/camA/detections", b"not json")
            .is_empty());
        let three_values =
            br#"{"cameraId": "camA", "detections": [{"class_name": "person", "bbox": [1.0, 2.0, 3.0]}]}"#;
        assert!(engine
            .evaluate("vision/camA/detections", three_values)
            .is_empty());
        let no_class = br#"{"cameraId": "camA", "detections": [{"bbox": [0.4, 0.4, 0.6, 0.6]}]}"#;
        assert!(engine
            .evaluate("vision/camA/detections", no_class)
            .is_empty());
    }

    #[test]
    fn class_outside_detect_set_is_ignored() {
        let clocks = SimulatedClocks::new(at("2025-01-30T10:15:00Z"));
        let mut engine = engine(clocks);
        let payload = br#"{"cameraId": "camA", "detections": [{"class_name": "car", "bbox": [0.4, 0.4, 0.6, 0.6]}]}"#;
        assert!(engine
            .evaluate("vision/camA/detections", payload)
            .is_empty());
    }

    #[test]
    fn center_outside_fence_is_ignored() {
        let clocks = SimulatedClocks::new(at("2025-01-30T10:15:00Z"));
        let mut engine = engine(clocks);
        // Center (0.05, 0.05) is outside Zone1.
        let payload = br#"{"cameraId": "camA", "detections": [{"class_name": "person", "bbox": [0.0, 0.0, 0.1, 0.1]}]}"#;
        assert!(engine
            .evaluate("vision/camA/detections", payload)
            .is_empty());
    }
}
