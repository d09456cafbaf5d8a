// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing infrastructure for the worker.
//!
//! Initialize once at startup:
//!
//! ```rust,ignore
//! use editd::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! All claim and pipeline events carry structured fields (`worker_id`,
//! `project`, `user`, `message_id`, `thread_id`) so a fleet's logs can be
//! sliced per owner.

mod init;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
