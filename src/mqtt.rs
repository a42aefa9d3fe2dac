// This file is part of Fenceline NVR, a fence-triggered network video recorder.
// Copyright (C) 2025 The Fenceline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! MQTT broker connection setup.

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};

use crate::cfg::MqttSettings;

/// Capacity of the request channel between the client handle and its event
/// loop.
const CHANNEL_CAPACITY: usize = 10;

pub fn qos(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Builds a client with a stable id. rumqttc owns reconnection; callers must
/// re-subscribe on every CONNACK they observe on the event loop.
pub fn connect(settings: &MqttSettings, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_session(true);
    if let Some(username) = &settings.username {
        options.set_credentials(
            username.clone(),
            settings.password.clone().unwrap_or_default(),
        );
    }
    AsyncClient::new(options, CHANNEL_CAPACITY)
}
