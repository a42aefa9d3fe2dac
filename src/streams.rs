// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stream URL rewriting.
//!
//! Camera catalogs carry host-facing RTSP URLs (suitable for playback on the
//! operator's machine). Inside the deployment the restreamer is reachable
//! under a different hostname, so loopback hosts are substituted before the
//! URL is handed to a worker.

use url::Url;

/// Rewrites a loopback host (`127.0.0.1`, `localhost`) to the internal
/// restreamer host/port; any other host is returned unchanged.
pub fn rewrite_internal(url: &str, internal_host: &str, internal_port: u16) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_owned();
    };
    match parsed.host_str() {
        Some("127.0.0.1") | Some("localhost") => {}
        _ => return url.to_owned(),
    }
    if parsed.set_host(Some(internal_host)).is_err() {
        return url.to_owned();
    }
    if parsed.set_port(Some(internal_port)).is_err() {
        return url.to_owned();
    }
    parsed.to_string()
}

/// Derives the overlay push URL from a pull URL: a `_raw` path tail becomes
/// `overlay`, anything else gets `_overlay` appended.
pub fn overlay_url(url: &str) -> String {
    if let Ok(mut parsed) = Url::parse(url) {
        let path = parsed.path().to_owned();
        if let Some((prefix, tail)) = path.rsplit_once('/') {
            let tail = match tail.strip_suffix("_raw") {
                Some(stem) => format!("{stem}overlay"),
                None => format!("{tail}_overlay"),
            };
            parsed.set_path(&format!("{prefix}/{tail}"));
            return parsed.to_string();
        }
    }
    format!("{url}_overlay")
}

/// Picks the URL a recorder should pull from: a non-loopback `rtspUrl` from
/// the catalog wins, else the stream is addressed through the internal
/// restreamer by its stream id.
pub fn record_url(
    stream_host: &str,
    stream_port: u16,
    stream_id: &str,
    rtsp_url: Option<&str>,
) -> String {
    if let Some(u) = rtsp_url {
        if u.starts_with("rtsp://") && !u.contains("127.0.0.1") && !u.contains("localhost") {
            return u.to_owned();
        }
    }
    format!("rtsp://{stream_host}:{stream_port}/{stream_id}")
}
