// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use anyhow::{bail, Error};
use std::future::Future;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use base::shutdown;

pub mod check;
pub mod fence;
pub mod launch;
pub mod record;

/// Builds the runtime and runs `inner` under signal-driven graceful shutdown.
///
/// The first SIGINT/SIGTERM drops the shutdown sender so every worker winds
/// down; a second signal aborts immediately.
pub(crate) fn run_with_shutdown<F, Fut>(inner: F) -> Result<i32, Error>
where
    F: FnOnce(shutdown::Receiver) -> Fut,
    Fut: Future<Output = Result<i32, Error>>,
{
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = rt.block_on(async_run(inner));

    // tokio normally waits for all spawned tasks to complete, but the
    // graceful path already joined the ones that matter, and the immediate
    // path shouldn't wait at all.
    rt.shutdown_background();

    result
}

async fn async_run<F, Fut>(inner: F) -> Result<i32, Error>
where
    F: FnOnce(shutdown::Receiver) -> Fut,
    Fut: Future<Output = Result<i32, Error>>,
{
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    tokio::pin! {
        let inner = inner(shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => bail!("immediate shutdown due to second signal (SIGINT)"),
        _ = term.recv() => bail!("immediate shutdown due to second signal (SIGTERM)"),
        result = &mut inner => result,
    }
}
