// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Glues decoding to egress for one inbound OTLP request.
//!
//! With a direct route every resource/scope group is sent to the sink before the request
//! returns and rejected counts come straight from the sink outcomes. With a buffered route
//! entries are queued and the request returns as soon as they are accepted into the buffer.

use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsPartialSuccess, ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use tracing::{debug, warn};

use crate::buffer::FlushErrorPolicy;
use crate::config::{EgressConfig, TelemetryLimits};
use crate::decoder::{DecodedResourceLogs, TelemetryDecoder};
use crate::egress::buffered::{BufferedEgress, EgressStatsSnapshot};
use crate::egress::{build_sink, EgressSink};
use crate::entry::BufferedEntry;
use crate::errors::{BufferError, EgressError, IngestError};

pub enum EgressRoute {
    Direct(Arc<dyn EgressSink>),
    Buffered(BufferedEgress),
}

/// Accepted and rejected record counts for one request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub rejected: usize,
}

impl IngestOutcome {
    /// OTLP response for the caller. `partial_success` is only set when something was rejected.
    pub fn into_response(self) -> ExportLogsServiceResponse {
        let partial_success = (self.rejected > 0).then(|| ExportLogsPartialSuccess {
            rejected_log_records: i64::try_from(self.rejected).unwrap_or(i64::MAX),
            error_message: format!("{} log records were rejected by the sink", self.rejected),
        });
        ExportLogsServiceResponse { partial_success }
    }
}

pub struct IngestionOrchestrator {
    decoder: TelemetryDecoder,
    route: EgressRoute,
}

impl IngestionOrchestrator {
    pub fn new(limits: TelemetryLimits, route: EgressRoute) -> Self {
        Self {
            decoder: TelemetryDecoder::new(limits),
            route,
        }
    }

    /// Builds the configured sink, buffered when its section has a `batching` block.
    /// Must be called from within a tokio runtime when batching is enabled.
    pub fn from_config(limits: TelemetryLimits, egress: &EgressConfig) -> Result<Self, EgressError> {
        let sink = build_sink(egress)?;
        let route = match egress.batching() {
            Some(batching) => {
                debug!(
                    "INGEST | Buffering {} egress: max_batch_size={}, max_batch_age={:?}",
                    sink.name(),
                    batching.max_batch_size,
                    batching.max_batch_age
                );
                EgressRoute::Buffered(BufferedEgress::start(
                    sink,
                    batching.clone(),
                    FlushErrorPolicy::Continue,
                ))
            }
            None => EgressRoute::Direct(sink),
        };
        Ok(Self::new(limits, route))
    }

    pub async fn ingest(
        &self,
        request: &ExportLogsServiceRequest,
    ) -> Result<IngestOutcome, IngestError> {
        let groups = self.decoder.decode(request);
        match &self.route {
            EgressRoute::Direct(sink) => Self::send_direct(sink.as_ref(), groups).await,
            EgressRoute::Buffered(buffered) => Self::enqueue(buffered, groups).await,
        }
    }

    async fn send_direct(
        sink: &dyn EgressSink,
        groups: Vec<DecodedResourceLogs>,
    ) -> Result<IngestOutcome, IngestError> {
        let mut outcome = IngestOutcome::default();
        let mut sent_groups = 0;
        let mut failed_groups = 0;
        let mut last_error = None;

        for group in groups {
            for scope in group.scopes {
                if scope.entries.is_empty() {
                    continue;
                }
                sent_groups += 1;
                let size = scope.entries.len();
                match sink.send(scope.entries, &group.resource).await {
                    Ok(result) => {
                        outcome.accepted += result.succeeded();
                        outcome.rejected += result.failed();
                    }
                    Err(e) => {
                        warn!(
                            "INGEST | {} failed for scope '{}' ({size} entries): {e}",
                            sink.name(),
                            scope.scope_name
                        );
                        outcome.rejected += size;
                        failed_groups += 1;
                        last_error = Some(e);
                    }
                }
            }
        }

        if failed_groups > 0 && failed_groups == sent_groups {
            if let Some(e) = last_error {
                return Err(IngestError::Egress(e));
            }
        }
        debug!(
            "INGEST | Sent {} groups: accepted={}, rejected={}",
            sent_groups, outcome.accepted, outcome.rejected
        );
        Ok(outcome)
    }

    async fn enqueue(
        buffered: &BufferedEgress,
        groups: Vec<DecodedResourceLogs>,
    ) -> Result<IngestOutcome, IngestError> {
        let mut outcome = IngestOutcome::default();
        for group in groups {
            for scope in group.scopes {
                for entry in scope.entries {
                    buffered
                        .enqueue(BufferedEntry {
                            resource: Arc::clone(&group.resource),
                            entry,
                        })
                        .await
                        // The engine only refuses entries once it is stopping or stopped
                        .map_err(|_| IngestError::ShuttingDown)?;
                    outcome.accepted += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Totals written by the buffered route, `None` for a direct route
    pub fn stats(&self) -> Option<EgressStatsSnapshot> {
        match &self.route {
            EgressRoute::Direct(_) => None,
            EgressRoute::Buffered(buffered) => Some(buffered.stats()),
        }
    }

    /// Resolves when a buffered route's consumer has exited. Never resolves for a direct route.
    pub async fn stopped(&self) {
        match &self.route {
            EgressRoute::Direct(_) => std::future::pending().await,
            EgressRoute::Buffered(buffered) => buffered.stopped().await,
        }
    }

    /// Drains and stops a buffered route. A no-op for a direct route.
    pub async fn shutdown(&self) -> Result<(), BufferError> {
        match &self.route {
            EgressRoute::Direct(_) => Ok(()),
            EgressRoute::Buffered(buffered) => buffered.shutdown().await,
        }
    }
}
