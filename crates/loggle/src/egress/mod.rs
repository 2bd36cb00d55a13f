// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Egress sinks that durably receive flushed batches.
//!
//! Every sink implements [`EgressSink`] and reports an [`EgressOutcome`] per batch. Records
//! the sink individually rejected are counted in the outcome; an `Err` means the whole batch
//! failed (sink unreachable, request refused). Which sink is used is decided at startup by
//! [`build_sink`] from the egress configuration.

pub mod buffered;
pub mod elasticsearch;
pub mod kafka;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{EgressConfig, EgressType};
use crate::entry::{Attributes, LogRecordEntry, ResourceContext, Severity};
use crate::errors::EgressError;

/// Result of writing one batch. `failed` never exceeds `attempted`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EgressOutcome {
    attempted: usize,
    failed: usize,
}

impl EgressOutcome {
    pub fn new(attempted: usize, failed: usize) -> Self {
        Self {
            attempted,
            failed: failed.min(attempted),
        }
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed
    }
}

#[async_trait]
pub trait EgressSink: Send + Sync {
    /// Writes `batch`, every entry of which was decoded from `resource`
    async fn send(
        &self,
        batch: Vec<LogRecordEntry>,
        resource: &ResourceContext,
    ) -> Result<EgressOutcome, EgressError>;

    fn name(&self) -> &'static str;
}

#[derive(Serialize)]
struct ServiceDocument<'a> {
    name: Option<&'a str>,
    version: Option<&'a str>,
    instance_id: Option<&'a str>,
}

/// JSON shape of one log entry as written by every sink
#[derive(Serialize)]
pub struct LogDocument<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: &'a DateTime<Utc>,
    severity: Severity,
    message: &'a str,
    attributes: &'a Attributes,
    span_id: &'a str,
    trace_id: &'a str,
    parent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_format: Option<&'a str>,
    flags: u32,
    service: ServiceDocument<'a>,
    resource_attributes: &'a Attributes,
}

impl<'a> LogDocument<'a> {
    pub fn new(entry: &'a LogRecordEntry, resource: &'a ResourceContext) -> Self {
        Self {
            timestamp: &entry.timestamp,
            severity: entry.severity,
            message: &entry.message,
            attributes: &entry.attributes,
            span_id: &entry.span_id,
            trace_id: &entry.trace_id,
            parent_id: &entry.parent_id,
            original_format: entry.original_format.as_deref(),
            flags: entry.flags,
            service: ServiceDocument {
                name: resource.service_name.as_deref(),
                version: resource.service_version.as_deref(),
                instance_id: resource.service_instance_id.as_deref(),
            },
            resource_attributes: &resource.attributes,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EgressError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Builds the sink selected by `config.egress_type`
pub fn build_sink(config: &EgressConfig) -> Result<Arc<dyn EgressSink>, EgressError> {
    match config.egress_type {
        EgressType::Elasticsearch => {
            let elasticsearch = config.elasticsearch.as_ref().ok_or_else(|| {
                EgressError::Configuration("missing elasticsearch egress section".to_string())
            })?;
            Ok(Arc::new(elasticsearch::ElasticsearchBulkEgress::new(
                elasticsearch,
            )?))
        }
        EgressType::Kafka => {
            let kafka = config.kafka.as_ref().ok_or_else(|| {
                EgressError::Configuration("missing kafka egress section".to_string())
            })?;
            Ok(Arc::new(kafka::KafkaEgress::from_config(kafka)?))
        }
    }
}
