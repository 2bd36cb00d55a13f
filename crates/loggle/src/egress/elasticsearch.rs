// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::config::ElasticsearchConfig;
use crate::egress::{EgressOutcome, EgressSink, LogDocument};
use crate::entry::{LogRecordEntry, ResourceContext};
use crate::errors::EgressError;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const CREATE_ACTION: &[u8] = b"{\"create\":{}}\n";

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl BulkItem {
    fn acknowledged(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Writes batches with the bulk API, one `create` operation per entry, into a data stream
/// that must already exist.
pub struct ElasticsearchBulkEgress {
    client: reqwest::Client,
    bulk_url: String,
}

impl ElasticsearchBulkEgress {
    pub fn new(config: &ElasticsearchConfig) -> Result<Self, EgressError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EgressError::Configuration(format!("unable to build http client: {e}")))?;
        Ok(Self::with_client(
            client,
            &config.ingest_url,
            &config.data_stream_name,
        ))
    }

    pub fn with_client(client: reqwest::Client, ingest_url: &str, data_stream_name: &str) -> Self {
        let bulk_url = format!(
            "{}/{}/_bulk?refresh=false&require_data_stream=true",
            ingest_url.trim_end_matches('/'),
            data_stream_name
        );
        Self { client, bulk_url }
    }

    fn build_body(
        batch: &[LogRecordEntry],
        resource: &ResourceContext,
    ) -> Result<Vec<u8>, EgressError> {
        let mut body = Vec::new();
        for entry in batch {
            body.extend_from_slice(CREATE_ACTION);
            serde_json::to_writer(&mut body, &LogDocument::new(entry, resource))?;
            body.push(b'\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl EgressSink for ElasticsearchBulkEgress {
    async fn send(
        &self,
        batch: Vec<LogRecordEntry>,
        resource: &ResourceContext,
    ) -> Result<EgressOutcome, EgressError> {
        if batch.is_empty() {
            return Ok(EgressOutcome::default());
        }
        let attempted = batch.len();
        let body = Self::build_body(&batch, resource)?;

        let response = self
            .client
            .post(&self.bulk_url)
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("EGRESS | Elasticsearch bulk request failed: {e}");
                EgressError::Transport(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("EGRESS | Elasticsearch bulk request rejected with {status}: {body}");
            return Err(EgressError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bulk: BulkResponse = response.json().await?;
        let acknowledged = bulk
            .items
            .iter()
            .filter(|item| item.values().any(BulkItem::acknowledged))
            .count();
        let outcome = EgressOutcome::new(attempted, attempted.saturating_sub(acknowledged));

        if outcome.failed() > 0 {
            let first_error = bulk
                .items
                .iter()
                .flat_map(|item| item.values())
                .find_map(|item| item.error.as_ref());
            warn!(
                "EGRESS | Elasticsearch rejected {} of {} documents (errors={}), first error: {:?}",
                outcome.failed(),
                attempted,
                bulk.errors,
                first_error
            );
        } else {
            debug!("EGRESS | Elasticsearch accepted {attempted} documents");
        }

        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}
