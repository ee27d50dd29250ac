// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle events emitted by instrumentation and the span shapes built from them.
//!
//! Instrumentation reports four kinds of events for every observed call edge:
//!
//! ```text
//!   inbound request ──> ServerReceive (sr)
//!                          │
//!                          ├──> ClientSend (cs) ──> ClientReceive (cr)   (0..n outbound calls)
//!                          │
//!   response sent  ──> ServerSend (ss)
//! ```
//!
//! All events belonging to one logical request share a transaction id. Each
//! event is turned into a [`SpanEvent`] and appended to the transaction's
//! [`PartialSpan`], which is promoted to a [`CompletedSpan`] when the request
//! finishes and was selected by the sampler.

use serde::Serialize;

/// Wall clock time in microseconds since the UNIX epoch.
pub type Micros = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    ServerReceive(ServerReceive),
    ServerSend(ServerSend),
    ClientSend(ClientSend),
    ClientReceive(ClientReceive),
}

impl LifecycleEvent {
    pub fn transaction_id(&self) -> &str {
        match self {
            LifecycleEvent::ServerReceive(e) => &e.transaction_id,
            LifecycleEvent::ServerSend(e) => &e.transaction_id,
            LifecycleEvent::ClientSend(e) => &e.transaction_id,
            LifecycleEvent::ClientReceive(e) => &e.transaction_id,
        }
    }
}

/// An inbound request reached the monitored service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReceive {
    pub transaction_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub host: String,
    pub endpoint: String,
    pub method: String,
    /// Client send time propagated by an instrumented caller, if any.
    pub origin_time: Option<Micros>,
    /// Capture this transaction regardless of the sampling decision.
    pub force_sample: bool,
    pub time: Micros,
}

/// The monitored service answered an inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSend {
    pub transaction_id: String,
    pub span_id: String,
    pub status_code: u16,
    /// Milliseconds between receive and send.
    pub response_time: i64,
    pub time: Micros,
}

/// The monitored service started an outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSend {
    pub transaction_id: String,
    pub span_id: String,
    pub host: String,
    pub endpoint: String,
    pub method: String,
    pub time: Micros,
}

/// An outbound call returned, either with a response or with an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReceive {
    pub transaction_id: String,
    pub span_id: String,
    pub host: String,
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub time: Micros,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanEventKind {
    Sr,
    Ss,
    Cs,
    Cr,
}

/// One recorded step of a span, serialized as `{ "type", "time", "data" }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    #[serde(rename = "type")]
    pub kind: SpanEventKind,
    pub time: Micros,
    pub data: SpanEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SpanEventData {
    ServerReceive(ServerReceiveData),
    ServerSend(ServerSendData),
    ClientSend(ClientSendData),
    ClientReceive(ClientReceiveData),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerReceiveData {
    pub rpc_id: String,
    pub endpoint: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_time: Option<Micros>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSendData {
    pub rpc_id: String,
    pub status_code: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSendData {
    pub rpc_id: String,
    pub method: String,
    pub host: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientReceiveData {
    pub rpc_id: String,
    pub host: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(rename = "err", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ServerReceive> for SpanEvent {
    fn from(event: &ServerReceive) -> Self {
        SpanEvent {
            kind: SpanEventKind::Sr,
            time: event.time,
            data: SpanEventData::ServerReceive(ServerReceiveData {
                rpc_id: event.span_id.clone(),
                endpoint: event.endpoint.clone(),
                method: event.method.clone(),
                parent: event.parent_span_id.clone(),
                origin_time: event.origin_time,
            }),
        }
    }
}

impl From<ServerSend> for SpanEvent {
    fn from(event: ServerSend) -> Self {
        SpanEvent {
            kind: SpanEventKind::Ss,
            time: event.time,
            data: SpanEventData::ServerSend(ServerSendData {
                rpc_id: event.span_id,
                status_code: event.status_code,
            }),
        }
    }
}

impl From<ClientSend> for SpanEvent {
    fn from(event: ClientSend) -> Self {
        SpanEvent {
            kind: SpanEventKind::Cs,
            time: event.time,
            data: SpanEventData::ClientSend(ClientSendData {
                rpc_id: event.span_id,
                method: event.method,
                host: event.host,
                endpoint: event.endpoint,
            }),
        }
    }
}

impl From<ClientReceive> for SpanEvent {
    fn from(event: ClientReceive) -> Self {
        SpanEvent {
            kind: SpanEventKind::Cr,
            time: event.time,
            data: SpanEventData::ClientReceive(ClientReceiveData {
                rpc_id: event.span_id,
                host: event.host,
                endpoint: event.endpoint,
                status_code: event.status_code,
                error: event.error,
            }),
        }
    }
}

/// In-progress span for a transaction that has been received but not yet answered.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialSpan {
    pub request_id: String,
    pub is_sampled: bool,
    pub is_force_sampled: bool,
    pub events: Vec<SpanEvent>,
}

impl PartialSpan {
    pub fn new(receive: &ServerReceive, is_sampled: bool) -> Self {
        PartialSpan {
            request_id: receive.transaction_id.clone(),
            is_sampled,
            is_force_sampled: receive.force_sample,
            events: vec![SpanEvent::from(receive)],
        }
    }

    pub fn push(&mut self, event: SpanEvent) {
        self.events.push(event);
    }

    /// Whether the span survives its closing `ServerSend`.
    pub fn is_kept(&self) -> bool {
        self.is_sampled || self.is_force_sampled
    }

    pub fn complete(self) -> CompletedSpan {
        CompletedSpan {
            request_id: self.request_id,
            is_sampled: self.is_sampled,
            is_force_sampled: self.is_force_sampled,
            events: self.events,
        }
    }
}

/// A finished, sampled span waiting for the next flush.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSpan {
    request_id: String,
    is_sampled: bool,
    is_force_sampled: bool,
    events: Vec<SpanEvent>,
}

impl CompletedSpan {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_sampled(&self) -> bool {
        self.is_sampled
    }

    pub fn is_force_sampled(&self) -> bool {
        self.is_force_sampled
    }

    pub fn events(&self) -> &[SpanEvent] {
        &self.events
    }
}
