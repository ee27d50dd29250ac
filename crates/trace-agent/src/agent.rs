// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span correlation and adaptive sampling.
//!
//! Each transaction id moves through `absent -> partial -> (completed | discarded)`:
//!
//! - `ServerReceive` counts the request, decides whether it is sampled and
//!   opens a [`PartialSpan`].
//! - `ClientSend` / `ClientReceive` append to the open span. Events for an
//!   unknown transaction (e.g. the agent started mid-request) are dropped.
//! - `ServerSend` closes the span. It is kept when sampled or force sampled.
//!
//! The sampling decision is cheap and local: a request is sampled when the
//! running request count is a multiple of the current sample rate. Once per
//! interval, [`SpanAgent::flush`] recomputes the rate from the traffic
//! actually observed so that roughly `sample_size` spans are captured per
//! interval regardless of load.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::{
    ClientReceive, ClientSend, CompletedSpan, LifecycleEvent, PartialSpan, ServerReceive,
    ServerSend, SpanEvent,
};
use crate::metrics::rpm::RpmMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// rate in force during the flushed interval
    pub rate: u64,
    pub total_request_count: u64,
}

/// What one flush ships to the collector's sample endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePayload {
    pub sample: Sample,
    pub spans: Vec<CompletedSpan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStats {
    pub sample_rate: u64,
    pub total_request_count: u64,
    pub partial_spans: usize,
    pub pending_spans: usize,
}

/// `max(1, round(total_request_count / sample_size))`
pub fn next_sample_rate(total_request_count: u64, sample_size: u64) -> u64 {
    let rate = (total_request_count as f64 / sample_size.max(1) as f64).round() as u64;
    rate.max(1)
}

pub struct SpanAgent {
    partials: HashMap<String, PartialSpan>,
    spans: Vec<CompletedSpan>,
    sample_rate: u64,
    total_request_count: u64,
    sample_size: u64,
    rpm_metrics: Option<Arc<RpmMetrics>>,
}

impl SpanAgent {
    pub fn new(initial_sample_rate: u64, sample_size: u64) -> Self {
        SpanAgent {
            partials: HashMap::new(),
            spans: Vec::new(),
            sample_rate: initial_sample_rate.max(1),
            total_request_count: 0,
            sample_size: sample_size.max(1),
            rpm_metrics: None,
        }
    }

    /// Records response time and status code of every finished request, sampled or not.
    #[must_use]
    pub fn with_rpm_metrics(mut self, rpm_metrics: Arc<RpmMetrics>) -> Self {
        self.rpm_metrics = Some(rpm_metrics);
        self
    }

    pub fn handle_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ServerReceive(e) => self.server_receive(e),
            LifecycleEvent::ServerSend(e) => self.server_send(e),
            LifecycleEvent::ClientSend(e) => self.client_send(e),
            LifecycleEvent::ClientReceive(e) => self.client_receive(e),
        }
    }

    pub fn server_receive(&mut self, event: ServerReceive) {
        self.total_request_count += 1;
        let is_sampled = self.total_request_count % self.sample_rate == 0;

        let partial = PartialSpan::new(&event, is_sampled);
        if self
            .partials
            .insert(event.transaction_id.clone(), partial)
            .is_some()
        {
            warn!(
                "Received a second server receive for open transaction {}, replacing its span",
                event.transaction_id
            );
        }
    }

    pub fn client_send(&mut self, event: ClientSend) {
        match self.partials.get_mut(&event.transaction_id) {
            Some(partial) => partial.push(SpanEvent::from(event)),
            None => debug!(
                "Dropping client send for unknown transaction {}",
                event.transaction_id
            ),
        }
    }

    pub fn client_receive(&mut self, event: ClientReceive) {
        match self.partials.get_mut(&event.transaction_id) {
            Some(partial) => partial.push(SpanEvent::from(event)),
            None => debug!(
                "Dropping client receive for unknown transaction {}",
                event.transaction_id
            ),
        }
    }

    pub fn server_send(&mut self, event: ServerSend) {
        if let Some(rpm_metrics) = &self.rpm_metrics {
            rpm_metrics.add_response_time(event.response_time);
            rpm_metrics.add_status_code(event.status_code);
        }

        let Some(mut partial) = self.partials.remove(&event.transaction_id) else {
            debug!(
                "Dropping server send for unknown transaction {}",
                event.transaction_id
            );
            return;
        };

        partial.push(SpanEvent::from(event));
        if partial.is_kept() {
            self.spans.push(partial.complete());
        }
    }

    /// Closes the interval: returns the interval's sample and spans, resets the
    /// counters and installs the sample rate derived from the interval's traffic.
    pub fn flush(&mut self) -> SamplePayload {
        let next_rate = next_sample_rate(self.total_request_count, self.sample_size);

        let payload = SamplePayload {
            sample: Sample {
                rate: self.sample_rate,
                total_request_count: self.total_request_count,
            },
            spans: std::mem::take(&mut self.spans),
        };

        self.total_request_count = 0;
        self.sample_rate = next_rate;
        payload
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            sample_rate: self.sample_rate,
            total_request_count: self.total_request_count,
            partial_spans: self.partials.len(),
            pending_spans: self.spans.len(),
        }
    }

    pub fn sample_rate(&self) -> u64 {
        self.sample_rate
    }

    pub fn total_request_count(&self) -> u64 {
        self.total_request_count
    }

    pub fn partial(&self, transaction_id: &str) -> Option<&PartialSpan> {
        self.partials.get(transaction_id)
    }

    pub fn pending_spans(&self) -> &[CompletedSpan] {
        &self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        ClientSendData, ServerReceiveData, ServerSendData, SpanEventData, SpanEventKind,
    };

    const TIME: u64 = 12345678;

    fn server_receive(id: &str) -> ServerReceive {
        ServerReceive {
            transaction_id: id.to_string(),
            span_id: "22".to_string(),
            parent_span_id: Some("0".to_string()),
            host: "localhost".to_string(),
            endpoint: "/?id=1".to_string(),
            method: "GET".to_string(),
            origin_time: None,
            force_sample: false,
            time: TIME,
        }
    }

    fn server_send(id: &str) -> ServerSend {
        ServerSend {
            transaction_id: id.to_string(),
            span_id: "22".to_string(),
            status_code: 200,
            response_time: 100,
            time: TIME,
        }
    }

    fn client_send(id: &str) -> ClientSend {
        ClientSend {
            transaction_id: id.to_string(),
            span_id: "new-span-id".to_string(),
            host: "remote-host".to_string(),
            endpoint: "/products".to_string(),
            method: "POST".to_string(),
            time: TIME,
        }
    }

    fn client_receive(id: &str) -> ClientReceive {
        ClientReceive {
            transaction_id: id.to_string(),
            span_id: "new-span-id".to_string(),
            host: "remote-host".to_string(),
            endpoint: "/products".to_string(),
            status_code: Some(201),
            error: None,
            time: TIME + 1,
        }
    }

    fn sr_event() -> SpanEvent {
        SpanEvent {
            kind: SpanEventKind::Sr,
            time: TIME,
            data: SpanEventData::ServerReceive(ServerReceiveData {
                rpc_id: "22".to_string(),
                endpoint: "/?id=1".to_string(),
                method: "GET".to_string(),
                parent: Some("0".to_string()),
                origin_time: None,
            }),
        }
    }

    #[test]
    fn test_server_receive_opens_partial_span() {
        let mut agent = SpanAgent::new(2, 10);
        agent.server_receive(server_receive("42"));

        assert_eq!(agent.total_request_count(), 1);
        assert_eq!(
            agent.partial("42"),
            Some(&PartialSpan {
                request_id: "42".to_string(),
                is_sampled: false,
                is_force_sampled: false,
                events: vec![sr_event()],
            })
        );
    }

    #[test]
    fn test_rate_one_samples_every_request() {
        let mut agent = SpanAgent::new(1, 10);
        for i in 0..20 {
            let id = i.to_string();
            agent.server_receive(server_receive(&id));
            assert!(agent.partial(&id).unwrap().is_sampled);
        }
    }

    #[test]
    fn test_rate_n_samples_every_nth_request() {
        let mut agent = SpanAgent::new(3, 10);
        let sampled = (1..=9)
            .map(|i| {
                let id = i.to_string();
                agent.server_receive(server_receive(&id));
                agent.partial(&id).unwrap().is_sampled
            })
            .collect::<Vec<_>>();
        assert_eq!(
            sampled,
            vec![false, false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn test_server_send_completes_sampled_span() {
        let mut agent = SpanAgent::new(1, 10);
        agent.server_receive(server_receive("42"));
        agent.server_send(server_send("42"));

        assert_eq!(agent.total_request_count(), 1);
        assert!(agent.partial("42").is_none());
        assert_eq!(agent.pending_spans().len(), 1);

        let span = &agent.pending_spans()[0];
        assert_eq!(span.request_id(), "42");
        assert!(span.is_sampled());
        assert!(!span.is_force_sampled());
        assert_eq!(
            span.events(),
            &[
                sr_event(),
                SpanEvent {
                    kind: SpanEventKind::Ss,
                    time: TIME,
                    data: SpanEventData::ServerSend(ServerSendData {
                        rpc_id: "22".to_string(),
                        status_code: 200,
                    }),
                }
            ]
        );
    }

    #[test]
    fn test_server_send_discards_unsampled_span() {
        let mut agent = SpanAgent::new(5, 10);
        agent.server_receive(server_receive("42"));
        agent.server_send(server_send("42"));

        assert!(agent.partial("42").is_none());
        assert!(agent.pending_spans().is_empty());
    }

    #[test]
    fn test_force_sample_overrides_discard() {
        let mut agent = SpanAgent::new(5, 10);
        let mut receive = server_receive("42");
        receive.force_sample = true;
        agent.server_receive(receive);
        agent.server_send(server_send("42"));

        assert_eq!(agent.pending_spans().len(), 1);
        assert!(!agent.pending_spans()[0].is_sampled());
        assert!(agent.pending_spans()[0].is_force_sampled());
    }

    #[test]
    fn test_client_send_appends_to_partial_span() {
        let mut agent = SpanAgent::new(1, 10);
        agent.server_receive(server_receive("42"));
        agent.client_send(client_send("42"));

        assert!(agent.pending_spans().is_empty());
        let partial = agent.partial("42").unwrap();
        assert_eq!(partial.events.len(), 2);
        assert_eq!(
            partial.events[1],
            SpanEvent {
                kind: SpanEventKind::Cs,
                time: TIME,
                data: SpanEventData::ClientSend(ClientSendData {
                    rpc_id: "new-span-id".to_string(),
                    method: "POST".to_string(),
                    host: "remote-host".to_string(),
                    endpoint: "/products".to_string(),
                }),
            }
        );
    }

    #[test]
    fn test_full_transaction_preserves_arrival_order() {
        let mut agent = SpanAgent::new(1, 10);
        agent.server_receive(server_receive("42"));
        agent.client_send(client_send("42"));
        agent.client_receive(client_receive("42"));
        agent.server_send(server_send("42"));

        let kinds = agent.pending_spans()[0]
            .events()
            .iter()
            .map(|event| event.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                SpanEventKind::Sr,
                SpanEventKind::Cs,
                SpanEventKind::Cr,
                SpanEventKind::Ss
            ]
        );
    }

    #[test]
    fn test_client_events_for_unknown_transaction_are_dropped() {
        let mut agent = SpanAgent::new(1, 10);
        agent.client_send(client_send("missing"));
        agent.client_receive(client_receive("missing"));
        agent.server_send(server_send("missing"));

        assert_eq!(agent.stats().partial_spans, 0);
        assert!(agent.pending_spans().is_empty());
    }

    #[test]
    fn test_fan_out_shares_one_partial_span() {
        let mut agent = SpanAgent::new(1, 10);
        agent.server_receive(server_receive("42"));
        for span_id in ["a", "b", "c"] {
            let mut send = client_send("42");
            send.span_id = span_id.to_string();
            agent.client_send(send);
        }

        assert_eq!(agent.stats().partial_spans, 1);
        assert_eq!(agent.partial("42").unwrap().events.len(), 4);
    }

    #[test]
    fn test_flush_ships_previous_rate_and_recomputes() {
        let mut agent = SpanAgent::new(2, 10);
        for i in 1..=6 {
            let id = i.to_string();
            agent.server_receive(server_receive(&id));
            agent.server_send(server_send(&id));
        }
        assert_eq!(agent.pending_spans().len(), 3);

        let payload = agent.flush();

        assert_eq!(
            payload.sample,
            Sample {
                rate: 2,
                total_request_count: 6
            }
        );
        assert_eq!(payload.spans.len(), 3);
        assert_eq!(agent.sample_rate(), 1);
        assert_eq!(agent.total_request_count(), 0);
        assert!(agent.pending_spans().is_empty());
    }

    #[test]
    fn test_flush_with_nothing_recorded() {
        let mut agent = SpanAgent::new(4, 10);
        let payload = agent.flush();

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "sample": { "rate": 4, "totalRequestCount": 0 },
                "spans": []
            })
        );
        assert_eq!(agent.sample_rate(), 1);
    }

    #[test]
    fn test_flush_keeps_open_transactions() {
        let mut agent = SpanAgent::new(1, 10);
        agent.server_receive(server_receive("42"));
        agent.flush();

        agent.server_send(server_send("42"));
        assert_eq!(agent.pending_spans().len(), 1);
    }

    #[test]
    fn test_next_sample_rate() {
        assert_eq!(next_sample_rate(6, 10), 1);
        assert_eq!(next_sample_rate(0, 10), 1);
        assert_eq!(next_sample_rate(15, 10), 2);
        assert_eq!(next_sample_rate(14, 10), 1);
        assert_eq!(next_sample_rate(6000, 60), 100);
        assert_eq!(next_sample_rate(10, 0), 10);
    }

    #[test]
    fn test_server_send_records_rpm() {
        let rpm = Arc::new(RpmMetrics::new());
        let mut agent = SpanAgent::new(5, 10).with_rpm_metrics(Arc::clone(&rpm));
        agent.server_receive(server_receive("42"));
        agent.server_send(server_send("42"));

        let snapshot = rpm.take_snapshot().unwrap();
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(snapshot.status_code.get(&200), Some(&1));
    }

    #[test]
    fn test_flushed_rate_drives_next_interval_sampling() {
        let mut agent = SpanAgent::new(1, 2);
        for i in 0..8 {
            agent.server_receive(server_receive(&format!("first-{i}")));
        }
        assert!((0..8).all(|i| agent.partial(&format!("first-{i}")).unwrap().is_sampled));

        let payload = agent.flush();
        assert_eq!(payload.sample.rate, 1);
        assert_eq!(payload.sample.total_request_count, 8);
        assert_eq!(agent.sample_rate(), 4);

        for i in 0..4 {
            agent.server_receive(server_receive(&format!("second-{i}")));
        }
        let sampled = (0..4)
            .map(|i| agent.partial(&format!("second-{i}")).unwrap().is_sampled)
            .collect::<Vec<_>>();
        assert_eq!(sampled, vec![false, false, false, true]);
    }
}
