// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection_limit;
pub mod connection_registry;
pub mod error;
pub mod handler;
pub mod http;
pub mod integrity;
pub mod key_vault;
pub mod message_store;
pub mod metrics;
pub mod plain_http;
pub mod protocol;
pub mod rate_limit;
pub mod relay;
pub mod user_directory;
