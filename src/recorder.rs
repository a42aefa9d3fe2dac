// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera rolling segment recorder.
//!
//! A muxer child writes clock-aligned MPEG-TS segments; two side loops keep
//! the dated directory tree ahead of the muxer and post-process closed
//! segments (`.ts` → `.mkv` → `.mp4`) once they stop changing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base::shutdown;
use chrono::{TimeDelta, Utc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cfg::RecordCamera;
use crate::muxer::{self, Encode, RemuxFormat};
use crate::segments;

/// Delay before restarting an exited muxer.
pub const RESTART_DELAY: Duration = Duration::from_secs(3);

const DIR_ENSURE_PERIOD: Duration = Duration::from_secs(60);
const POSTPROCESS_PERIOD: Duration = Duration::from_secs(1);

/// Memo of already-postprocessed paths, capped so a long-lived recorder
/// doesn't accumulate one entry per segment forever.
pub struct ProcessedSet {
    seen: HashSet<PathBuf>,
    order: VecDeque<PathBuf>,
    cap: usize,
}

impl ProcessedSet {
    pub fn new(cap: usize) -> Self {
        ProcessedSet {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.seen.contains(path)
    }

    pub fn insert(&mut self, path: PathBuf) {
        if !self.seen.insert(path.clone()) {
            return;
        }
        self.order.push_back(path);
        if self.order.len() > self.cap {
            while self.order.len() > self.cap / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

/// Tracks `.ts` files across polls and reports the ones whose size and mtime
/// have settled for at least `stable_seconds`.
pub struct StabilityTracker {
    state: HashMap<PathBuf, (u64, SystemTime)>,
    stable_seconds: u64,
}

impl StabilityTracker {
    pub fn new(stable_seconds: i64) -> Self {
        StabilityTracker {
            state: HashMap::new(),
            stable_seconds: stable_seconds.max(0) as u64,
        }
    }

    /// Scans the given directories and returns newly-stable `.ts` paths in
    /// mtime order.
    pub fn poll(&mut self, dirs: &[PathBuf], now: SystemTime) -> Vec<PathBuf> {
        let mut candidates: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("ts") {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let Ok(mtime) = meta.modified() else {
                    continue;
                };
                seen.insert(path.clone());
                candidates.push((mtime, meta.len(), path));
            }
        }
        candidates.sort();

        let mut stable = Vec::new();
        for (mtime, size, path) in candidates {
            match self.state.get(&path) {
                Some(&(prev_size, prev_mtime)) if (size, mtime) == (prev_size, prev_mtime) => {
                    let age = now
                        .duration_since(mtime)
                        .unwrap_or(Duration::ZERO)
                        .as_secs();
                    if age >= self.stable_seconds {
                        self.state.remove(&path);
                        stable.push(path);
                    }
                }
                _ => {
                    self.state.insert(path, (size, mtime));
                }
            }
        }
        self.state.retain(|path, _| seen.contains(path));
        stable
    }
}

pub struct Recorder {
    pub camera: RecordCamera,
    pub recordings_dir: PathBuf,
    pub segment_seconds: i64,
    pub postprocess_faststart: bool,
    pub postprocess_remux_mp4: bool,
    pub postprocess_stable_seconds: i64,
    pub shutdown_rx: shutdown::Receiver,
}

impl Recorder {
    /// Runs the muxer supervision loop plus its side loops until shutdown.
    pub async fn run(self) {
        ensure_day_dirs(&self.recordings_dir, &self.camera.camera_id);

        let dirs = tokio::spawn(ensure_dirs_loop(
            self.recordings_dir.clone(),
            self.camera.camera_id.clone(),
            self.shutdown_rx.clone(),
        ));
        let post = tokio::spawn(postprocess_loop(
            self.recordings_dir.clone(),
            self.camera.camera_id.clone(),
            self.postprocess_faststart,
            self.postprocess_remux_mp4,
            self.postprocess_stable_seconds,
            self.shutdown_rx.clone(),
        ));

        let pattern = segments::strftime_pattern(&self.recordings_dir, &self.camera.camera_id);
        let label = format!("recorder {}", self.camera.camera_id);
        while self.shutdown_rx.check().is_ok() {
            let args = muxer::segment_args(
                &self.camera.rtsp_url,
                self.segment_seconds,
                Encode::Copy,
                &pattern,
            );
            info!(camera = %self.camera.camera_id, %pattern, "recording");
            match muxer::run(&args, &self.shutdown_rx, &label).await {
                Ok(Some(status)) => {
                    warn!(camera = %self.camera.camera_id, %status, "recorder muxer exited, restarting");
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(camera = %self.camera.camera_id, %err, "failed to spawn recorder muxer");
                }
            }
            tokio::select! {
                _ = sleep(RESTART_DELAY) => {}
                _ = self.shutdown_rx.wait() => break,
            }
        }

        let _ = dirs.await;
        let _ = post.await;
        info!(camera = %self.camera.camera_id, "recorder stopped");
    }
}

fn ensure_day_dirs(root: &Path, camera_id: &str) {
    let now = Utc::now();
    for ts in [now, now + TimeDelta::days(1)] {
        let dir = segments::day_dir(root, camera_id, ts);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), %err, "unable to create segment directory");
        }
    }
}

/// Keeps today's and tomorrow's directories present so the muxer never fails
/// a segment open at date rollover.
async fn ensure_dirs_loop(root: PathBuf, camera_id: String, shutdown_rx: shutdown::Receiver) {
    loop {
        ensure_day_dirs(&root, &camera_id);
        tokio::select! {
            _ = sleep(DIR_ENSURE_PERIOD) => {}
            _ = shutdown_rx.wait() => return,
        }
    }
}

async fn postprocess_loop(
    root: PathBuf,
    camera_id: String,
    faststart: bool,
    remux_mp4: bool,
    stable_seconds: i64,
    shutdown_rx: shutdown::Receiver,
) {
    let mut tracker = StabilityTracker::new(stable_seconds);
    let mut processed = ProcessedSet::new(500);
    loop {
        let now = Utc::now();
        let dirs = [
            segments::day_dir(&root, &camera_id, now),
            segments::day_dir(&root, &camera_id, now - TimeDelta::days(1)),
        ];
        for path in tracker.poll(&dirs, SystemTime::now()) {
            if processed.contains(&path) {
                continue;
            }
            if !faststart {
                info!(path = %path.display(), "postprocess disabled, keeping raw segment");
                continue;
            }
            if let Some(output) =
                postprocess_segment(&path, remux_mp4, &shutdown_rx).await
            {
                processed.insert(path);
                debug!(path = %output.display(), "segment postprocessed");
            }
        }
        tokio::select! {
            _ = sleep(POSTPROCESS_PERIOD) => {}
            _ = shutdown_rx.wait() => return,
        }
    }
}

/// Remuxes a stable `.ts` to `.mkv` (stream copy), then optionally on to a
/// faststart `.mp4`. Returns the final path on success.
async fn postprocess_segment(
    path: &Path,
    remux_mp4: bool,
    shutdown_rx: &shutdown::Receiver,
) -> Option<PathBuf> {
    let mkv = path.with_extension("mkv");
    let tmp = tmp_path(&mkv);
    let args = muxer::remux_args(path, RemuxFormat::Matroska, &tmp);
    match muxer::run(&args, shutdown_rx, "segment remux").await {
        Ok(Some(status)) if status.success() => {}
        Ok(None) => {
            let _ = std::fs::remove_file(&tmp);
            return None;
        }
        Ok(Some(_)) | Err(_) => {
            let _ = std::fs::remove_file(&tmp);
            warn!(path = %path.display(), "postprocess remux failed");
            return None;
        }
    }
    if let Err(err) = std::fs::rename(&tmp, &mkv) {
        warn!(path = %mkv.display(), %err, "unable to finalize remuxed segment");
        let _ = std::fs::remove_file(&tmp);
        return None;
    }
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), %err, "unable to remove raw segment");
    }
    info!(path = %mkv.display(), "recorded segment");

    if !remux_mp4 {
        return Some(mkv);
    }
    match remux_to_mp4(&mkv, shutdown_rx).await {
        Some(mp4) => {
            info!(path = %mp4.display(), "remuxed segment to mp4");
            Some(mp4)
        }
        None => Some(mkv),
    }
}

async fn remux_to_mp4(mkv: &Path, shutdown_rx: &shutdown::Receiver) -> Option<PathBuf> {
    let mp4 = mkv.with_extension("mp4");
    if let Ok(meta) = std::fs::metadata(&mp4) {
        if meta.len() > 0 {
            return Some(mp4);
        }
    }
    let tmp = tmp_path(&mp4);
    let args = muxer::remux_args(mkv, RemuxFormat::Mp4Faststart, &tmp);
    match muxer::run(&args, shutdown_rx, "mp4 remux").await {
        Ok(Some(status)) if status.success() => {}
        _ => {
            let _ = std::fs::remove_file(&tmp);
            warn!(path = %mkv.display(), "mp4 remux failed");
            return None;
        }
    }
    if let Err(err) = std::fs::rename(&tmp, &mp4) {
        warn!(path = %mp4.display(), %err, "unable to finalize mp4 segment");
        let _ = std::fs::remove_file(&tmp);
        return None;
    }
    if let Err(err) = std::fs::remove_file(mkv) {
        warn!(path = %mkv.display(), %err, "unable to remove mkv after remux");
    }
    Some(mp4)
}

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/rec/camA/2025-01/30/10-05-00.mkv")),
            Path::new("/rec/camA/2025-01/30/10-05-00.mkv.tmp")
        );
    }

    #[test]
    fn processed_set_caps_and_trims() {
        let mut set = ProcessedSet::new(500);
        for i in 0..501 {
            set.insert(PathBuf::from(format!("/rec/{i}.ts")));
        }
        // Overflow trims to the newest half.
        assert_eq!(set.seen.len(), 250);
        assert_eq!(set.order.len(), 250);
        assert!(!set.contains(Path::new("/rec/0.ts")));
        assert!(!set.contains(Path::new("/rec/250.ts")));
        assert!(set.contains(Path::new("/rec/251.ts")));
        assert!(set.contains(Path::new("/rec/500.ts")));
    }

    #[test]
    fn processed_set_dedups() {
        let mut set = ProcessedSet::new(500);
        set.insert(PathBuf::from("/rec/a.ts"));
        set.insert(PathBuf::from("/rec/a.ts"));
        assert_eq!(set.seen.len(), 1);
        assert_eq!(set.order.len(), 1);
    }

    #[test]
    fn stability_requires_two_identical_polls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-05-00.ts");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let mut tracker = StabilityTracker::new(0);
        let dirs = vec![dir.path().to_path_buf()];
        // First poll only records the state.
        assert!(tracker.poll(&dirs, SystemTime::now()).is_empty());
        // Second poll with unchanged size/mtime reports it.
        assert_eq!(tracker.poll(&dirs, SystemTime::now()), vec![path.clone()]);
        // Once reported, the path is forgotten until it changes again.
        assert!(tracker.poll(&dirs, SystemTime::now()).is_empty());
    }

    #[test]
    fn stability_honors_minimum_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10-05-00.ts");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let mut tracker = StabilityTracker::new(3600);
        let dirs = vec![dir.path().to_path_buf()];
        assert!(tracker.poll(&dirs, SystemTime::now()).is_empty());
        // Unchanged, but far too young.
        assert!(tracker.poll(&dirs, SystemTime::now()).is_empty());
    }

    #[test]
    fn stability_ignores_other_extensions_and_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("10-05-00.mkv")).unwrap();
        let ts = dir.path().join("10-10-00.ts");
        std::fs::File::create(&ts).unwrap();

        let mut tracker = StabilityTracker::new(0);
        let dirs = vec![dir.path().to_path_buf()];
        assert!(tracker.poll(&dirs, SystemTime::now()).is_empty());
        std::fs::remove_file(&ts).unwrap();
        assert!(tracker.poll(&dirs, SystemTime::now()).is_empty());
        assert!(tracker.state.is_empty());
    }
}
