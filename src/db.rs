// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Access to the `events` table.
//!
//! The pool connects lazily so a service can come up before (or without) the
//! database; individual statement failures are the caller's to log and
//! swallow. Events are inserted with `ON CONFLICT DO NOTHING`, so redelivery
//! of the same id is harmless.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub camera_id: String,
    pub class_name: String,
    pub ts: DateTime<Utc>,
    pub score: Option<f64>,
}

/// Generates an opaque event id: `evt_` plus 12 hex chars.
pub fn new_event_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("evt_{}", &hex[..12])
}

pub fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy(url)
}

pub async fn insert_event(pool: &PgPool, event: &Event) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO events (id, camera_id, class_name, ts, thumbnail, score) \
         VALUES ($1, $2, $3, $4, NULL, $5) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(&event.id)
    .bind(&event.camera_id)
    .bind(&event.class_name)
    .bind(event.ts)
    .bind(event.score)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_thumbnail(
    pool: &PgPool,
    event_id: &str,
    thumbnail: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE events SET thumbnail = $1 WHERE id = $2")
        .bind(thumbnail)
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(())
}
