// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Event clip extraction.
//!
//! Events arrive over MQTT into a FIFO queue; a single worker drains it. The
//! preferred path stitches pre-roll from the short-segment buffer and records
//! post-roll live; the fallback path waits for the long rolling segments that
//! intersect the clip window. Either way a single muxer pass renders the
//! final MP4, and the event row's thumbnail is updated on success.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base::shutdown;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use sqlx::postgres::PgPool;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cfg::{RecordCamera, Settings};
use crate::db;
use crate::msg::EventMessage;
use crate::muxer::{self, Encode};
use crate::recorder::tmp_path;
use crate::segments;

/// The window a clip should span around an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipWindow {
    pub event_id: String,
    pub camera_id: String,
    pub event_ts: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ClipWindow {
    pub fn new(
        event_id: String,
        camera_id: String,
        event_ts: DateTime<Utc>,
        pre_seconds: i64,
        post_seconds: i64,
    ) -> Self {
        ClipWindow {
            event_id,
            camera_id,
            start: event_ts - TimeDelta::seconds(pre_seconds),
            end: event_ts + TimeDelta::seconds(post_seconds),
            event_ts,
        }
    }
}

/// Parses an event timestamp: RFC 3339 with `Z` or offset, or a naive
/// ISO-8601 string taken as UTC.
pub fn parse_event_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|n| n.and_utc())
}

/// When a long segment becomes readable: its end (or the clip end, for the
/// segment still being written) plus the configured grace.
pub fn segment_ready_at(
    seg_start: DateTime<Utc>,
    segment_seconds: i64,
    clip_end: DateTime<Utc>,
    grace_seconds: i64,
) -> DateTime<Utc> {
    let seg_end = seg_start + TimeDelta::seconds(segment_seconds);
    seg_end.min(clip_end) + TimeDelta::seconds(grace_seconds)
}

/// Seek offset into the concatenated input, clamped at zero.
pub fn clip_offset(clip_start: DateTime<Utc>, first_segment_start: DateTime<Utc>) -> f64 {
    let millis = (clip_start - first_segment_start).num_milliseconds();
    (millis.max(0) as f64) / 1000.0
}

/// Writes a concat-demuxer manifest listing the inputs in order.
pub fn write_concat_manifest(path: &Path, inputs: &[PathBuf]) -> std::io::Result<()> {
    use std::fmt::Write;
    let mut contents = String::new();
    for input in inputs {
        let _ = writeln!(contents, "file '{}'", input.display());
    }
    std::fs::write(path, contents)
}

/// Removes a temp file when dropped, so every exit path releases it.
struct TempGuard(PathBuf);

impl TempGuard {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

enum Existing {
    Absent,
    /// Present and at least the minimum size; reuse it.
    Reusable,
    /// Present but undersized; it has been deleted for regeneration.
    Removed,
}

fn check_existing(output: &Path, min_bytes: u64) -> std::io::Result<Existing> {
    match std::fs::metadata(output) {
        Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Existing::Absent),
        Err(err) => Err(err),
        Ok(meta) if meta.len() >= min_bytes => Ok(Existing::Reusable),
        Ok(_) => {
            std::fs::remove_file(output)?;
            Ok(Existing::Removed)
        }
    }
}

fn find_segment_file(root: &Path, camera_id: &str, start: DateTime<Utc>) -> Option<PathBuf> {
    for ext in ["ts", "mp4", "mkv"] {
        let path = segments::segment_path(root, camera_id, start, ext);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

pub struct Clipper {
    pub settings: Settings,
    pub cameras: HashMap<String, RecordCamera>,
    pub pool: Option<PgPool>,
    pub shutdown_rx: shutdown::Receiver,
}

impl Clipper {
    /// Drains the event queue until shutdown.
    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<EventMessage>) {
        if let Err(err) = std::fs::create_dir_all(&self.settings.events_dir) {
            warn!(dir = %self.settings.events_dir.display(), %err, "unable to create events directory");
        }
        loop {
            tokio::select! {
                _ = self.shutdown_rx.wait() => break,
                message = queue.recv() => match message {
                    None => break,
                    Some(message) => self.handle_event(message).await,
                },
            }
        }
        info!("clipper stopped");
    }

    async fn handle_event(&self, message: EventMessage) {
        let Some(event_ts) = parse_event_ts(&message.ts) else {
            warn!(event = %message.id, ts = %message.ts, "unparseable event timestamp, skipping");
            return;
        };
        let window = ClipWindow::new(
            message.id,
            message.camera_id,
            event_ts,
            self.settings.pre_seconds,
            self.settings.post_seconds,
        );
        if self.settings.buffer_enabled {
            match self.cameras.get(&window.camera_id) {
                Some(camera) => {
                    if self.clip_from_buffer(&window, camera).await {
                        return;
                    }
                }
                None => {
                    warn!(
                        event = %window.event_id,
                        camera = %window.camera_id,
                        "no camera config for event, falling back to segments"
                    );
                }
            }
        }
        self.clip_from_segments(&window).await;
    }

    /// Preferred path: pre-roll from the buffer tree plus live post-roll.
    /// Returns `false` only when the segment fallback should run instead.
    async fn clip_from_buffer(&self, window: &ClipWindow, camera: &RecordCamera) -> bool {
        info!(
            event = %window.event_id,
            camera = %window.camera_id,
            clip_start = %window.start,
            clip_end = %window.end,
            "extracting clip from buffer"
        );
        let expected = segments::buffer_starts(
            window.start,
            window.event_ts,
            self.settings.buffer_segment_seconds,
        );
        let (_, missing) = self.scan_buffer(&window.camera_id, &expected);
        if !missing.is_empty() {
            warn!(
                event = %window.event_id,
                camera = %window.camera_id,
                missing = %missing.join("; "),
                "missing pre-buffer segments"
            );
        }

        // Record post-roll live while the pre-roll (hopefully) settles.
        let post_tmp = TempGuard(std::env::temp_dir().join(format!("post_{}.ts", window.event_id)));
        let encode = if self.settings.buffer_reencode {
            Encode::H264LowLatency {
                gop: self.settings.buffer_gop,
            }
        } else {
            Encode::Copy
        };
        let args = muxer::postroll_args(
            &camera.rtsp_url,
            encode,
            self.settings.post_seconds,
            post_tmp.path(),
        );
        info!(event = %window.event_id, seconds = self.settings.post_seconds, "recording post-roll");
        match muxer::run(&args, &self.shutdown_rx, "post-roll").await {
            Ok(Some(status)) if status.success() && post_tmp.path().exists() => {}
            Ok(None) => return true,
            _ => {
                warn!(event = %window.event_id, "failed to record post-roll");
                return true;
            }
        }

        if !missing.is_empty() && self.settings.buffer_ready_grace > 0 {
            if self
                .pause(Duration::from_secs(self.settings.buffer_ready_grace as u64))
                .await
            {
                return true;
            }
        }
        // Late arrivals count; everything below works off this second scan.
        let (pairs, vanished) = self.scan_buffer(&window.camera_id, &expected);
        if !vanished.is_empty() {
            warn!(
                event = %window.event_id,
                camera = %window.camera_id,
                missing = %vanished.join("; "),
                "pre-buffer segments still missing"
            );
        }

        let concat =
            TempGuard(std::env::temp_dir().join(format!("concat_{}.txt", window.event_id)));
        let mut inputs: Vec<PathBuf> = pairs.iter().map(|(_, p)| p.clone()).collect();
        inputs.push(post_tmp.path().to_owned());
        if let Err(err) = write_concat_manifest(concat.path(), &inputs) {
            warn!(event = %window.event_id, %err, "unable to write concat manifest");
            return true;
        }

        let (offset, duration) = match pairs.first() {
            Some((first_start, _)) => (
                clip_offset(window.start, *first_start),
                (self.settings.pre_seconds + self.settings.post_seconds) as f64,
            ),
            None => (0.0, self.settings.post_seconds as f64),
        };
        self.render_and_record(window, concat.path(), offset, duration)
            .await;
        true
    }

    fn scan_buffer(
        &self,
        camera_id: &str,
        expected: &[DateTime<Utc>],
    ) -> (Vec<(DateTime<Utc>, PathBuf)>, Vec<String>) {
        let mut pairs = Vec::new();
        let mut missing = Vec::new();
        for &start in expected {
            let path =
                segments::segment_path(&self.settings.buffer_dir, camera_id, start, "ts");
            match std::fs::metadata(&path) {
                Ok(meta) if meta.len() > 0 => pairs.push((start, path)),
                _ => missing.push(format!("{}:{}", start.to_rfc3339(), path.display())),
            }
        }
        (pairs, missing)
    }

    /// Fallback path: wait for the long segments intersecting the window.
    async fn clip_from_segments(&self, window: &ClipWindow) {
        info!(
            event = %window.event_id,
            camera = %window.camera_id,
            clip_start = %window.start,
            clip_end = %window.end,
            "extracting clip from segments"
        );
        let starts = segments::covering_starts(window.start, window.end, self.settings.segment_seconds);
        let deadline = Utc::now() + TimeDelta::seconds(self.settings.segment_max_wait);

        let mut found: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
        let mut last_missing: Vec<String> = Vec::new();
        loop {
            if self.shutdown_rx.check().is_err() {
                return;
            }
            found.clear();
            last_missing.clear();
            let now = Utc::now();
            for &start in &starts {
                let ready = segment_ready_at(
                    start,
                    self.settings.segment_seconds,
                    window.end,
                    self.settings.segment_ready_grace,
                );
                if now < ready {
                    last_missing.push(format!(
                        "not_ready start={} ready_after={}",
                        start.to_rfc3339(),
                        ready.to_rfc3339()
                    ));
                    continue;
                }
                let Some(path) =
                    find_segment_file(&self.settings.recordings_dir, &window.camera_id, start)
                else {
                    last_missing.push(format!("missing_file start={}", start.to_rfc3339()));
                    continue;
                };
                match std::fs::metadata(&path) {
                    Ok(meta) if meta.len() > 0 => found.push((start, path)),
                    _ => last_missing.push(format!(
                        "empty_file start={} path={}",
                        start.to_rfc3339(),
                        path.display()
                    )),
                }
            }
            if last_missing.is_empty() && !found.is_empty() {
                break;
            }
            if Utc::now() > deadline {
                break;
            }
            if self.pause(Duration::from_secs(1)).await {
                return;
            }
        }

        if found.is_empty() || !last_missing.is_empty() {
            if found.is_empty() {
                warn!(
                    event = %window.event_id,
                    camera = %window.camera_id,
                    clip_start = %window.start,
                    clip_end = %window.end,
                    missing = %last_missing.join("; "),
                    "no segment files for event, aborting clip"
                );
                return;
            }
            // Partial coverage after the deadline: render what exists.
            warn!(
                event = %window.event_id,
                missing = %last_missing.join("; "),
                "proceeding with partial segment coverage"
            );
        }

        let duration = (window.end - window.start).num_milliseconds() as f64 / 1000.0;
        if duration <= 0.0 {
            warn!(event = %window.event_id, "non-positive clip duration");
            return;
        }
        let offset = clip_offset(window.start, found[0].0);

        let concat =
            TempGuard(std::env::temp_dir().join(format!("concat_{}.txt", window.event_id)));
        let inputs: Vec<PathBuf> = found.iter().map(|(_, p)| p.clone()).collect();
        if let Err(err) = write_concat_manifest(concat.path(), &inputs) {
            warn!(event = %window.event_id, %err, "unable to write concat manifest");
            return;
        }
        self.render_and_record(window, concat.path(), offset, duration)
            .await;
    }

    /// Renders the final MP4 (or reuses a previous one) and records the
    /// thumbnail reference.
    async fn render_and_record(
        &self,
        window: &ClipWindow,
        concat_list: &Path,
        offset: f64,
        duration: f64,
    ) {
        let output_name = format!("{}.mp4", window.event_id);
        let output = self.settings.events_dir.join(&output_name);
        match check_existing(&output, self.settings.event_min_bytes) {
            Ok(Existing::Reusable) => {
                info!(event = %window.event_id, "clip already exists");
                self.set_thumbnail(&window.event_id, &output_name).await;
                return;
            }
            Ok(Existing::Removed) => {
                warn!(event = %window.event_id, "existing clip too small, regenerating");
            }
            Ok(Existing::Absent) => {}
            Err(err) => {
                warn!(event = %window.event_id, %err, "unable to stat existing clip");
                return;
            }
        }

        let tmp = TempGuard(tmp_path(&output));
        let args = muxer::clip_args(concat_list, offset, duration, tmp.path());
        match muxer::run(&args, &self.shutdown_rx, "clip render").await {
            Ok(Some(status)) if status.success() => {}
            Ok(None) => return,
            _ => {
                warn!(event = %window.event_id, "muxer failed rendering clip");
                return;
            }
        }
        match std::fs::metadata(tmp.path()) {
            Ok(meta) if meta.len() >= self.settings.event_min_bytes => {}
            _ => {
                warn!(event = %window.event_id, "clip too small after encode, discarding");
                return;
            }
        }
        if let Err(err) = std::fs::rename(tmp.path(), &output) {
            warn!(event = %window.event_id, %err, "unable to finalize clip");
            return;
        }
        info!(event = %window.event_id, path = %output.display(), "wrote event clip");
        self.set_thumbnail(&window.event_id, &output_name).await;
    }

    async fn set_thumbnail(&self, event_id: &str, output_name: &str) {
        let Some(pool) = &self.pool else { return };
        if let Err(err) = db::update_thumbnail(pool, event_id, output_name).await {
            warn!(event = %event_id, %err, "failed to update event thumbnail");
        }
    }

    /// Sleeps unless shutdown arrives first; returns `true` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = self.shutdown_rx.wait() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn window_spans_pre_and_post_roll() {
        let w = ClipWindow::new(
            "evt_0011aabbccdd".into(),
            "camA".into(),
            at("2025-01-30T10:07:15Z"),
            10,
            10,
        );
        assert_eq!(w.start, at("2025-01-30T10:07:05Z"));
        assert_eq!(w.end, at("2025-01-30T10:07:25Z"));
    }

    #[test]
    fn event_ts_accepts_offset_and_naive() {
        assert_eq!(
            parse_event_ts("2025-01-30T10:07:15Z"),
            Some(at("2025-01-30T10:07:15Z"))
        );
        assert_eq!(
            parse_event_ts("2025-01-30T18:07:15+08:00"),
            Some(at("2025-01-30T10:07:15Z"))
        );
        assert_eq!(
            parse_event_ts("2025-01-30T10:07:15"),
            Some(at("2025-01-30T10:07:15Z"))
        );
        assert_eq!(parse_event_ts("bogus"), None);
    }

    #[test]
    fn single_segment_plan() {
        // A 10:07:15 event with 10 s either side: one 300 s segment
        // starting 10:05:00, sought 125 s in, 20 s out.
        let w = ClipWindow::new(
            "evt_0011aabbccdd".into(),
            "camA".into(),
            at("2025-01-30T10:07:15Z"),
            10,
            10,
        );
        let starts = segments::covering_starts(w.start, w.end, 300);
        assert_eq!(starts, vec![at("2025-01-30T10:05:00Z")]);
        assert_eq!(clip_offset(w.start, starts[0]), 125.0);
        assert_eq!((w.end - w.start).num_seconds(), 20);
    }

    #[test]
    fn offset_clamps_at_zero() {
        assert_eq!(
            clip_offset(at("2025-01-30T10:00:00Z"), at("2025-01-30T10:00:05Z")),
            0.0
        );
    }

    #[test]
    fn ready_time_tracks_clip_end_for_live_segment() {
        // A segment still being written is readable once the clip window has
        // passed (plus grace), not only when the whole segment closes.
        let ready = segment_ready_at(at("2025-01-30T10:05:00Z"), 300, at("2025-01-30T10:07:25Z"), 2);
        assert_eq!(ready, at("2025-01-30T10:07:27Z"));
        let ready = segment_ready_at(at("2025-01-30T10:00:00Z"), 300, at("2025-01-30T10:07:25Z"), 2);
        assert_eq!(ready, at("2025-01-30T10:05:02Z"));
    }

    #[test]
    fn manifest_lists_inputs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("concat_evt_0011aabbccdd.txt");
        write_concat_manifest(
            &manifest,
            &[
                PathBuf::from("/buf/camA/2025-01/30/10-07-05.ts"),
                PathBuf::from("/tmp/post_evt_0011aabbccdd.ts"),
            ],
        )
        .unwrap();
        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert_eq!(
            contents,
            "file '/buf/camA/2025-01/30/10-07-05.ts'\nfile '/tmp/post_evt_0011aabbccdd.ts'\n"
        );
    }

    #[test]
    fn existing_clip_states() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("evt_0011aabbccdd.mp4");

        assert!(matches!(
            check_existing(&output, 4096).unwrap(),
            Existing::Absent
        ));

        std::fs::File::create(&output)
            .unwrap()
            .write_all(&[0u8; 16])
            .unwrap();
        assert!(matches!(
            check_existing(&output, 4096).unwrap(),
            Existing::Removed
        ));
        assert!(!output.exists());

        std::fs::File::create(&output)
            .unwrap()
            .write_all(&vec![0u8; 4096])
            .unwrap();
        assert!(matches!(
            check_existing(&output, 4096).unwrap(),
            Existing::Reusable
        ));
    }

    #[test]
    fn temp_guard_releases_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("post_evt_0011aabbccdd.ts");
        std::fs::File::create(&path).unwrap();
        {
            let _guard = TempGuard(path.clone());
        }
        assert!(!path.exists());
    }
}
