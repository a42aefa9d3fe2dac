// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The external muxer (ffmpeg) as an opaque collaborator: command-line
//! construction plus supervised child processes.
//!
//! Children are stopped politely (SIGTERM, then up to five seconds of grace)
//! before being killed, so the muxer gets a chance to finalize whatever
//! container it is writing.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::warn;

use base::shutdown;

pub const FFMPEG_BIN: &str = "ffmpeg";

const CHILD_GRACE: Duration = Duration::from_secs(5);

/// Video handling for recorder children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encode {
    /// Stream copy; cheapest, but segments begin on whatever GOP the camera
    /// sends.
    Copy,

    /// Re-encode with a fixed small GOP so every segment starts on a
    /// keyframe.
    H264LowLatency { gop: u32 },
}

/// Target container of a stabilization remux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxFormat {
    Matroska,
    Mp4Faststart,
}

fn push_rtsp_input(args: &mut Vec<String>, input_url: &str) {
    for a in [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-rtsp_transport",
        "tcp",
        "-i",
        input_url,
        "-an",
    ] {
        args.push(a.to_owned());
    }
}

fn push_encode(args: &mut Vec<String>, encode: Encode) {
    match encode {
        Encode::Copy => {
            args.push("-c".to_owned());
            args.push("copy".to_owned());
        }
        Encode::H264LowLatency { gop } => {
            let gop = gop.to_string();
            for a in [
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-g",
                gop.as_str(),
                "-keyint_min",
                gop.as_str(),
                "-sc_threshold",
                "0",
                "-pix_fmt",
                "yuv420p",
            ] {
                args.push(a.to_owned());
            }
        }
    }
}

/// Arguments for a rolling segment writer: clock-aligned MPEG-TS segments
/// with per-segment timestamp resets, filenames templated on the segment
/// start.
pub fn segment_args(
    input_url: &str,
    segment_seconds: i64,
    encode: Encode,
    pattern: &str,
) -> Vec<String> {
    let mut args = Vec::new();
    push_rtsp_input(&mut args, input_url);
    push_encode(&mut args, encode);
    let segment_time = segment_seconds.to_string();
    for a in [
        "-f",
        "segment",
        "-segment_time",
        segment_time.as_str(),
        "-segment_atclocktime",
        "1",
        "-reset_timestamps",
        "1",
        "-segment_format",
        "mpegts",
        "-strftime",
        "1",
        pattern,
    ] {
        args.push(a.to_owned());
    }
    args
}

/// Arguments for a stabilization remux (stream copy) of a closed segment.
pub fn remux_args(input: &Path, format: RemuxFormat, tmp_output: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-y",
        "-fflags",
        "+genpts+discardcorrupt",
        "-err_detect",
        "ignore_err",
        "-i",
    ]
    .map(str::to_owned)
    .into();
    args.push(input.to_string_lossy().into_owned());
    args.push("-c".to_owned());
    args.push("copy".to_owned());
    match format {
        RemuxFormat::Matroska => {
            args.push("-f".to_owned());
            args.push("matroska".to_owned());
        }
        RemuxFormat::Mp4Faststart => {
            for a in ["-movflags", "+faststart", "-f", "mp4"] {
                args.push(a.to_owned());
            }
        }
    }
    args.push(tmp_output.to_string_lossy().into_owned());
    args
}

/// Arguments to live-record exactly `post_seconds` of post-roll into an
/// MPEG-TS temp file.
pub fn postroll_args(
    input_url: &str,
    encode: Encode,
    post_seconds: i64,
    output: &Path,
) -> Vec<String> {
    let mut args = Vec::new();
    push_rtsp_input(&mut args, input_url);
    push_encode(&mut args, encode);
    let limit = post_seconds.to_string();
    for a in ["-t", limit.as_str(), "-f", "mpegts"] {
        args.push(a.to_owned());
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Arguments for the single clip-rendering pass: concat-demux the manifest,
/// seek, bound the duration, and re-encode to a faststart MP4.
pub fn clip_args(
    concat_list: &Path,
    offset_seconds: f64,
    duration_seconds: f64,
    tmp_output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-y",
        "-fflags",
        "+genpts+discardcorrupt",
        "-err_detect",
        "ignore_err",
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
    ]
    .map(str::to_owned)
    .into();
    args.push(concat_list.to_string_lossy().into_owned());
    args.push("-ss".to_owned());
    args.push(offset_seconds.to_string());
    args.push("-t".to_owned());
    args.push(duration_seconds.to_string());
    for a in [
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-crf",
        "23",
        "-an",
        "-movflags",
        "+faststart",
        "-f",
        "mp4",
    ] {
        args.push(a.to_owned());
    }
    args.push(tmp_output.to_string_lossy().into_owned());
    args
}

pub fn spawn(args: &[String]) -> std::io::Result<Child> {
    Command::new(FFMPEG_BIN)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

/// Stops a child: SIGTERM, a bounded wait, then SIGKILL.
pub async fn stop(child: &mut Child, what: &str) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(%what, %err, "failed to signal muxer");
    }
    match tokio::time::timeout(CHILD_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(%what, "muxer ignored SIGTERM, killing");
            if let Err(err) = child.kill().await {
                warn!(%what, %err, "failed to kill muxer");
            }
        }
    }
}

/// Runs a muxer invocation to completion, honoring shutdown. Returns `None`
/// when interrupted by shutdown.
pub async fn run(
    args: &[String],
    shutdown_rx: &shutdown::Receiver,
    what: &str,
) -> std::io::Result<Option<ExitStatus>> {
    let mut child = spawn(args)?;
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = shutdown_rx.wait() => None,
    };
    match status {
        Some(status) => status.map(Some),
        None => {
            stop(&mut child, what).await;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_writer_is_clock_aligned() {
        let args = segment_args(
            "rtsp://go2rtc:8554/camA_raw",
            300,
            Encode::Copy,
            "/rec/camA/%Y-%m/%d/%H-%M-%S.ts",
        );
        let expected: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-rtsp_transport",
            "tcp",
            "-i",
            "rtsp://go2rtc:8554/camA_raw",
            "-an",
            "-c",
            "copy",
            "-f",
            "segment",
            "-segment_time",
            "300",
            "-segment_atclocktime",
            "1",
            "-reset_timestamps",
            "1",
            "-segment_format",
            "mpegts",
            "-strftime",
            "1",
            "/rec/camA/%Y-%m/%d/%H-%M-%S.ts",
        ]
        .map(str::to_owned)
        .into();
        assert_eq!(args, expected);
    }

    #[test]
    fn low_latency_encode_pins_gop() {
        let args = segment_args(
            "rtsp://go2rtc:8554/camA_raw",
            1,
            Encode::H264LowLatency { gop: 10 },
            "/buf/camA/%Y-%m/%d/%H-%M-%S.ts",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264 -preset veryfast -tune zerolatency"));
        assert!(joined.contains("-g 10 -keyint_min 10 -sc_threshold 0 -pix_fmt yuv420p"));
        assert!(joined.contains("-segment_time 1"));
    }

    #[test]
    fn remux_targets() {
        let args = remux_args(
            Path::new("/rec/camA/2025-01/30/10-05-00.ts"),
            RemuxFormat::Matroska,
            Path::new("/rec/camA/2025-01/30/10-05-00.mkv.tmp"),
        );
        let joined = args.join(" ");
        assert!(joined.ends_with("-c copy -f matroska /rec/camA/2025-01/30/10-05-00.mkv.tmp"));

        let args = remux_args(
            Path::new("/rec/camA/2025-01/30/10-05-00.mkv"),
            RemuxFormat::Mp4Faststart,
            Path::new("/rec/camA/2025-01/30/10-05-00.mp4.tmp"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-movflags +faststart -f mp4"));
    }

    #[test]
    fn clip_seeks_and_bounds_duration() {
        let args = clip_args(
            Path::new("/tmp/concat_evt_0011aabbccdd.txt"),
            125.0,
            20.0,
            Path::new("/events/evt_0011aabbccdd.mp4.tmp"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /tmp/concat_evt_0011aabbccdd.txt"));
        assert!(joined.contains("-ss 125 -t 20"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -crf 23 -an"));
        assert!(joined.ends_with("/events/evt_0011aabbccdd.mp4.tmp"));
    }

    #[test]
    fn postroll_is_time_bounded() {
        let args = postroll_args(
            "rtsp://go2rtc:8554/camA_raw",
            Encode::Copy,
            10,
            Path::new("/tmp/post_evt_0011aabbccdd.ts"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-t 10 -f mpegts"));
        assert!(joined.ends_with("/tmp/post_evt_0011aabbccdd.ts"));
    }
}
