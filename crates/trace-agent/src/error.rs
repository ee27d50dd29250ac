// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::CollectorError;

/// Errors that can occur while starting or stopping the trace agent
#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Services already stopped")]
    AlreadyStopped,

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,

    #[error("Runtime error: {0}")]
    Runtime(String),
}
