// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Aggregation and publication daemon for filesystem change-log streams.
// A broker fans requests out to one reader thread per metadata target
// device; readers buffer records locally and hand ownership of a batch
// to whichever consumer asks for it next. An optional worker-pool mode
// trades per-consumer ordering for throughput by draining a single
// shared ring across every device.

pub mod error;
pub mod wire;
pub mod source;
pub mod cache;
pub mod config;
pub mod transport;
pub mod reader;
pub mod broker;
pub mod client;
pub mod lb_ring;
pub mod worker;
pub mod signals;

pub use error::{LcapError, LcapResult};
