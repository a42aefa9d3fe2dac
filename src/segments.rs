// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock-aligned segment timeline and on-disk layout.
//!
//! Segments live under `<root>/<camera_id>/<YYYY-MM>/<DD>/<HH-MM-SS>.<ext>`,
//! where the filename encodes the segment's clock-aligned start in UTC.
//! Because starts are floored to a multiple of the segment duration, the
//! `[start, start + duration)` intervals of one camera never overlap.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};

/// Floors a timestamp to the enclosing segment start.
pub fn floor_to_segment(ts: DateTime<Utc>, segment_seconds: i64) -> DateTime<Utc> {
    debug_assert!(segment_seconds > 0);
    let epoch = ts.timestamp();
    let floored = epoch - epoch.rem_euclid(segment_seconds);
    DateTime::from_timestamp(floored, 0).expect("floored timestamp in range")
}

/// The per-camera day directory holding a given instant's segments.
pub fn day_dir(root: &Path, camera_id: &str, ts: DateTime<Utc>) -> PathBuf {
    root.join(camera_id)
        .join(ts.format("%Y-%m").to_string())
        .join(ts.format("%d").to_string())
}

/// Full path of the segment starting at `start`, with the given extension.
pub fn segment_path(root: &Path, camera_id: &str, start: DateTime<Utc>, ext: &str) -> PathBuf {
    day_dir(root, camera_id, start).join(format!("{}.{ext}", start.format("%H-%M-%S")))
}

/// The strftime output pattern handed to the muxer for a camera's tree.
pub fn strftime_pattern(root: &Path, camera_id: &str) -> String {
    root.join(camera_id)
        .join("%Y-%m")
        .join("%d")
        .join("%H-%M-%S.ts")
        .to_string_lossy()
        .into_owned()
}

/// Starts of every segment whose interval intersects `[from, to]`.
pub fn covering_starts(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    segment_seconds: i64,
) -> Vec<DateTime<Utc>> {
    let mut starts = Vec::new();
    let mut current = floor_to_segment(from, segment_seconds);
    let last = floor_to_segment(to, segment_seconds);
    while current <= last {
        starts.push(current);
        current += TimeDelta::seconds(segment_seconds);
    }
    starts
}

/// Starts of the pre-buffer segments expected to cover `[clip_start,
/// event_ts)`.
pub fn buffer_starts(
    clip_start: DateTime<Utc>,
    event_ts: DateTime<Utc>,
    buffer_segment_seconds: i64,
) -> Vec<DateTime<Utc>> {
    let mut starts = Vec::new();
    let mut current = floor_to_segment(clip_start, buffer_segment_seconds);
    while current < event_ts {
        starts.push(current);
        current += TimeDelta::seconds(buffer_segment_seconds);
    }
    starts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn floor_alignment() {
        assert_eq!(
            floor_to_segment(at("2025-01-30T10:07:15Z"), 300),
            at("2025-01-30T10:05:00Z")
        );
        assert_eq!(
            floor_to_segment(at("2025-01-30T10:05:00Z"), 300),
            at("2025-01-30T10:05:00Z")
        );
        assert_eq!(
            floor_to_segment(at("2025-01-30T10:07:15.600Z"), 1),
            at("2025-01-30T10:07:15Z")
        );
    }

    #[test]
    fn path_layout() {
        let p = segment_path(Path::new("/rec"), "camA", at("2025-01-30T10:05:00Z"), "ts");
        assert_eq!(p, Path::new("/rec/camA/2025-01/30/10-05-00.ts"));
        let p = segment_path(Path::new("/rec"), "camA", at("2025-01-30T10:05:00Z"), "mp4");
        assert_eq!(p, Path::new("/rec/camA/2025-01/30/10-05-00.mp4"));
    }

    #[test]
    fn muxer_pattern_matches_layout() {
        assert_eq!(
            strftime_pattern(Path::new("/rec"), "camA"),
            "/rec/camA/%Y-%m/%d/%H-%M-%S.ts"
        );
    }

    #[test]
    fn covering_one_segment() {
        // Event at 10:07:15 with 10 s of roll either side stays inside the
        // 10:05:00 segment.
        let starts = covering_starts(at("2025-01-30T10:07:05Z"), at("2025-01-30T10:07:25Z"), 300);
        assert_eq!(starts, vec![at("2025-01-30T10:05:00Z")]);
    }

    #[test]
    fn covering_spans_boundary() {
        let starts = covering_starts(at("2025-01-30T10:04:55Z"), at("2025-01-30T10:05:15Z"), 300);
        assert_eq!(
            starts,
            vec![at("2025-01-30T10:00:00Z"), at("2025-01-30T10:05:00Z")]
        );
    }

    #[test]
    fn covering_starts_are_disjoint() {
        let starts = covering_starts(at("2025-01-30T00:00:01Z"), at("2025-01-30T01:00:00Z"), 300);
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], TimeDelta::seconds(300));
        }
    }

    #[test]
    fn buffer_starts_cover_pre_roll() {
        // 1 s segments for an event at 10:07:15 with 10 s pre-roll: exactly
        // the ten starts 10:07:05 ..= 10:07:14.
        let starts = buffer_starts(at("2025-01-30T10:07:05Z"), at("2025-01-30T10:07:15Z"), 1);
        assert_eq!(starts.len(), 10);
        assert_eq!(starts[0], at("2025-01-30T10:07:05Z"));
        assert_eq!(starts[9], at("2025-01-30T10:07:14Z"));
    }

    #[test]
    fn buffer_starts_exclude_event_instant() {
        let starts = buffer_starts(at("2025-01-30T10:07:15Z"), at("2025-01-30T10:07:15Z"), 1);
        assert!(starts.is_empty());
    }
}
