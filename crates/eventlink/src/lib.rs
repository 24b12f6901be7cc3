// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport layer for container log lines, platform events and per-request
//! monitoring samples.
//!
//! The crate provides four pieces that move bursty telemetry between many
//! producers and a few consumers:
//!
//! - [`reliable`]: request/reply event delivery with a per-attempt deadline and
//!   bounded retries, built on the transport-independent [`retry`] combinator.
//! - [`bulk`] and [`pool`]: fire-and-forget, topic-prefixed publishing for log
//!   shipping, one connection per worker.
//! - [`monitor`]: the UDP ingestion server for newline-delimited monitoring
//!   batches, feeding the [`store_service`] actor.
//! - [`buffer`]: a byte buffer whose every operation is serialized behind one
//!   lock.
//!
//! [`health`] exposes a pollable health gauge and [`discovery`] resolves the
//! broker endpoint at startup.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod bulk;
pub mod constants;
pub mod discovery;
pub mod errors;
pub mod event;
pub mod health;
pub mod monitor;
pub mod pool;
pub mod reliable;
pub mod retry;
pub mod sample;
pub mod store;
pub mod store_service;
pub mod util;
pub mod wire;
