// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera pre-buffer recorder: very short rolling segments kept just long
//! enough to cover the pre-roll horizon of a future event clip.
//!
//! Segments are optionally re-encoded with a fixed small GOP so a clip can
//! start on any segment boundary without decoder warm-up artefacts.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base::shutdown;
use chrono::{TimeDelta, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cfg::RecordCamera;
use crate::muxer::{self, Encode};
use crate::recorder::RESTART_DELAY;
use crate::segments;

const RETENTION_PERIOD: Duration = Duration::from_secs(5);

pub struct BufferRecorder {
    pub camera: RecordCamera,
    pub buffer_dir: PathBuf,
    pub segment_seconds: i64,
    pub retention_seconds: i64,
    pub reencode: bool,
    pub gop: u32,
    pub shutdown_rx: shutdown::Receiver,
}

impl BufferRecorder {
    pub async fn run(self) {
        let retention = tokio::spawn(retention_loop(
            self.buffer_dir.join(&self.camera.camera_id),
            self.retention_seconds,
            self.shutdown_rx.clone(),
        ));

        let pattern = segments::strftime_pattern(&self.buffer_dir, &self.camera.camera_id);
        let encode = if self.reencode {
            Encode::H264LowLatency { gop: self.gop }
        } else {
            Encode::Copy
        };
        let label = format!("buffer recorder {}", self.camera.camera_id);
        while self.shutdown_rx.check().is_ok() {
            let now = Utc::now();
            for ts in [now, now + TimeDelta::days(1)] {
                let dir = segments::day_dir(&self.buffer_dir, &self.camera.camera_id, ts);
                if let Err(err) = std::fs::create_dir_all(&dir) {
                    warn!(dir = %dir.display(), %err, "unable to create buffer directory");
                }
            }
            let args =
                muxer::segment_args(&self.camera.rtsp_url, self.segment_seconds, encode, &pattern);
            info!(camera = %self.camera.camera_id, %pattern, "buffer recording");
            match muxer::run(&args, &self.shutdown_rx, &label).await {
                Ok(Some(status)) => {
                    warn!(camera = %self.camera.camera_id, %status, "buffer muxer exited, restarting");
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(camera = %self.camera.camera_id, %err, "failed to spawn buffer muxer");
                }
            }
            tokio::select! {
                _ = sleep(RESTART_DELAY) => {}
                _ = self.shutdown_rx.wait() => break,
            }
        }

        let _ = retention.await;
        info!(camera = %self.camera.camera_id, "buffer recorder stopped");
    }
}

async fn retention_loop(base: PathBuf, retention_seconds: i64, shutdown_rx: shutdown::Receiver) {
    loop {
        let cutoff = SystemTime::now() - Duration::from_secs(retention_seconds.max(0) as u64);
        sweep_expired(&base, cutoff);
        tokio::select! {
            _ = sleep(RETENTION_PERIOD) => {}
            _ = shutdown_rx.wait() => return,
        }
    }
}

/// Deletes `.ts` files under `base` whose mtime predates `cutoff`.
pub fn sweep_expired(base: &Path, cutoff: SystemTime) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            sweep_expired(&path, cutoff);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("ts") {
            continue;
        }
        let Ok(mtime) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if mtime < cutoff {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "unable to delete expired buffer segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_deletes_only_expired_ts() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("camA/2025-01/30");
        std::fs::create_dir_all(&day).unwrap();
        let old_ts = day.join("10-07-05.ts");
        let mkv = day.join("10-07-06.mkv");
        std::fs::File::create(&old_ts).unwrap();
        std::fs::File::create(&mkv).unwrap();

        // Everything written above predates a cutoff in the future.
        sweep_expired(dir.path(), SystemTime::now() + Duration::from_secs(60));
        assert!(!old_ts.exists());
        assert!(mkv.exists());
    }

    #[test]
    fn sweep_keeps_fresh_segments() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("camA/2025-01/30");
        std::fs::create_dir_all(&day).unwrap();
        let fresh = day.join("10-07-05.ts");
        std::fs::File::create(&fresh).unwrap();

        sweep_expired(dir.path(), SystemTime::now() - Duration::from_secs(60));
        assert!(fresh.exists());
    }

    #[test]
    fn sweep_tolerates_missing_root() {
        sweep_expired(Path::new("/nonexistent/buffer/camA"), SystemTime::now());
    }
}
