// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock sinks for integration tests

use async_trait::async_trait;
use loggle::egress::{EgressOutcome, EgressSink};
use loggle::entry::{LogRecordEntry, ResourceContext};
use loggle::errors::EgressError;
use std::sync::Mutex;

/// One call to [`RecordingSink::send`]
#[derive(Clone, Debug)]
pub struct RecordedSend {
    pub resource: ResourceContext,
    pub entries: Vec<LogRecordEntry>,
}

/// Keeps every batch it is given and acknowledges all of it
#[derive(Default)]
pub struct RecordingSink {
    sends: Mutex<Vec<RecordedSend>>,
}

impl RecordingSink {
    pub fn sends(&self) -> Vec<RecordedSend> {
        self.sends.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|send| send.entries.len())
            .collect()
    }
}

#[async_trait]
impl EgressSink for RecordingSink {
    async fn send(
        &self,
        batch: Vec<LogRecordEntry>,
        resource: &ResourceContext,
    ) -> Result<EgressOutcome, EgressError> {
        let attempted = batch.len();
        self.sends.lock().unwrap().push(RecordedSend {
            resource: resource.clone(),
            entries: batch,
        });
        Ok(EgressOutcome::new(attempted, 0))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Answers every send like a bulk endpoint whose data stream does not exist
pub struct MissingDataStreamSink;

#[async_trait]
impl EgressSink for MissingDataStreamSink {
    async fn send(
        &self,
        _batch: Vec<LogRecordEntry>,
        _resource: &ResourceContext,
    ) -> Result<EgressOutcome, EgressError> {
        Err(EgressError::Status {
            status: 404,
            body: "index_not_found_exception".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "missing-data-stream"
    }
}
