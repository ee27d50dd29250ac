// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process tracing agent.
//!
//! Lifecycle events from instrumentation are correlated into spans by the
//! [`agent`], which keeps an adaptively sampled subset of requests. Process,
//! request and network-edge metrics are aggregated in [`metrics`]. Everything
//! is shipped periodically to the trace collector through [`collector`].
//! [`services`] wires the pieces together for a host process.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod agent_service;
pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod http_utils;
pub mod metrics;
pub mod proc;
pub mod sample_flusher;
pub mod services;
