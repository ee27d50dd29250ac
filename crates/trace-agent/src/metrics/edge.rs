// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Statistics about outbound calls, grouped by protocol and target host.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::collector::{CollectorApi, CollectorError};
use crate::metrics::{nearest_rank, MetricsSource, Percentiles};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    Ok,
    NotOk,
}

/// Milliseconds spent on the wire in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkDelay {
    pub incoming: i64,
    pub outgoing: i64,
}

/// One observed outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeReport {
    pub protocol: String,
    pub target_host: String,
    pub target_service_key: Option<u64>,
    pub network_delay: NetworkDelay,
    pub status: EdgeStatus,
    pub response_time: i64,
}

#[derive(Debug, Default)]
struct EdgeTargetRecord {
    target_service_key: Option<u64>,
    response_time: Vec<i64>,
    network_delay_incoming: Vec<i64>,
    network_delay_outgoing: Vec<i64>,
    ok: u64,
    not_ok: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeStatusCounts {
    pub ok: u64,
    pub not_ok: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTargetMetrics {
    pub target_service_key: Option<u64>,
    pub response_time: Percentiles,
    pub network_delay_incoming: Percentiles,
    pub network_delay_outgoing: Percentiles,
    pub status: EdgeStatusCounts,
}

/// protocol -> target host -> statistics
pub type EdgeSnapshot = BTreeMap<String, BTreeMap<String, EdgeTargetMetrics>>;

type EdgeRecords = HashMap<String, HashMap<String, EdgeTargetRecord>>;

#[derive(Debug, Default)]
pub struct EdgeMetrics {
    records: Mutex<EdgeRecords>,
}

impl EdgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, report: EdgeReport) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .entry(report.protocol)
            .or_default()
            .entry(report.target_host)
            .or_insert_with(|| EdgeTargetRecord {
                target_service_key: report.target_service_key,
                ..Default::default()
            });

        record.response_time.push(report.response_time);
        record
            .network_delay_incoming
            .push(report.network_delay.incoming);
        record
            .network_delay_outgoing
            .push(report.network_delay.outgoing);

        match report.status {
            EdgeStatus::Ok => record.ok += 1,
            EdgeStatus::NotOk => record.not_ok += 1,
        }
    }

    /// Takes the current window, leaving the aggregator empty.
    pub fn take_snapshot(&self) -> EdgeSnapshot {
        let records =
            std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner));

        records
            .into_iter()
            .map(|(protocol, hosts)| {
                let hosts = hosts
                    .into_iter()
                    .filter_map(|(host, record)| Some((host, Self::summarize(record)?)))
                    .collect::<BTreeMap<_, _>>();
                (protocol, hosts)
            })
            .filter(|(_, hosts)| !hosts.is_empty())
            .collect()
    }

    fn summarize(mut record: EdgeTargetRecord) -> Option<EdgeTargetMetrics> {
        Some(EdgeTargetMetrics {
            target_service_key: record.target_service_key,
            response_time: nearest_rank(&mut record.response_time)?,
            network_delay_incoming: nearest_rank(&mut record.network_delay_incoming)?,
            network_delay_outgoing: nearest_rank(&mut record.network_delay_outgoing)?,
            status: EdgeStatusCounts {
                ok: record.ok,
                not_ok: record.not_ok,
            },
        })
    }
}

#[async_trait]
impl MetricsSource for EdgeMetrics {
    fn name(&self) -> &'static str {
        "EDGE"
    }

    async fn flush_to(&self, api: &CollectorApi) -> Result<(), CollectorError> {
        let snapshot = self.take_snapshot();
        if snapshot.is_empty() {
            debug!("EDGE | nothing reported in this window, skipping send");
            return Ok(());
        }
        api.send_edge_metrics(&snapshot).await
    }
}
