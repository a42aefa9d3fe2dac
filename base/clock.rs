// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Abstract interface to the wall clock. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<DateTime<Utc>>>);

impl SimulatedClocks {
    pub fn new(boot: DateTime<Utc>) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(boot)))
    }
}

impl Clocks for SimulatedClocks {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.lock().unwrap();
        *l += TimeDelta::from_std(how_long).expect("sleep duration out of range");
    }
}
