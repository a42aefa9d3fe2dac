// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use bpaf::Bpaf;
use tracing::{debug, error};

mod cfg;
mod clipper;
mod cmds;
mod db;
mod fence;
mod mqtt;
mod msg;
mod muxer;
mod prebuffer;
mod recorder;
mod segments;
mod streams;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fenceline NVR: fence-triggered multi-camera recording and events.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for the respective subcommands.
    Check(#[bpaf(external(cmds::check::args))] cmds::check::Args),
    Fence(#[bpaf(external(cmds::fence::args))] cmds::fence::Args),
    Launch(#[bpaf(external(cmds::launch::args))] cmds::launch::Args),
    Record(#[bpaf(external(cmds::record::args))] cmds::record::Args),
}

impl Args {
    fn run(self) -> Result<i32, anyhow::Error> {
        match self {
            Args::Check(a) => cmds::check::run(a),
            Args::Fence(a) => cmds::fence::run(a),
            Args::Launch(a) => cmds::launch::run(a),
            Args::Record(a) => cmds::record::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as `target/debug/fenceline`:
    // `fenceline`), falling back to the crate name if conversion fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!("exiting due to error: {e:#}");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv);
        }
    }
}
