// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous batching in front of an [`EgressSink`].
//!
//! [`BufferedEgress::start`] creates a [`BufferingEngine`] and spawns its consumer task.
//! Producers enqueue [`BufferedEntry`] values and return immediately. Each flushed batch is
//! split into runs of consecutive entries that share a resource and sent run by run. Since
//! the caller has already returned, outcomes are only observable through [`EgressStats`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::buffer::{BufferHandle, BufferingEngine, FlushErrorPolicy, FlushHandler};
use crate::config::BufferConfig;
use crate::egress::{EgressOutcome, EgressSink};
use crate::entry::BufferedEntry;
use crate::errors::{BufferError, EgressError, FlushError};

/// Running totals of what a buffered sink has written. `batches` counts flushed batches,
/// however many sends a batch was split into.
#[derive(Debug, Default)]
pub struct EgressStats {
    batches: AtomicU64,
    attempted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EgressStatsSnapshot {
    pub batches: u64,
    pub attempted: u64,
    pub failed: u64,
}

impl EgressStats {
    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, outcome: EgressOutcome) {
        self.attempted
            .fetch_add(outcome.attempted() as u64, Ordering::Relaxed);
        self.failed
            .fetch_add(outcome.failed() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EgressStatsSnapshot {
        EgressStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            attempted: self.attempted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct SinkFlushHandler {
    sink: Arc<dyn EgressSink>,
    stats: Arc<EgressStats>,
}

#[async_trait]
impl FlushHandler<BufferedEntry> for SinkFlushHandler {
    async fn flush(&mut self, batch: Vec<BufferedEntry>) -> Result<(), FlushError> {
        self.stats.record_batch();
        // The first fatal error wins so a later transient one cannot mask it
        let mut batch_error: Option<EgressError> = None;
        let mut entries = batch.into_iter().peekable();

        while let Some(first) = entries.next() {
            let resource = first.resource;
            let mut run = vec![first.entry];
            while let Some(next) = entries.next_if(|next| Arc::ptr_eq(&next.resource, &resource)) {
                run.push(next.entry);
            }

            let size = run.len();
            match self.sink.send(run, &resource).await {
                Ok(outcome) => self.stats.record(outcome),
                Err(e) => {
                    error!("EGRESS | {} failed to write {size} entries: {e}", self.sink.name());
                    self.stats.record(EgressOutcome::new(size, size));
                    if !batch_error.as_ref().is_some_and(EgressError::is_fatal) {
                        batch_error = Some(e);
                    }
                }
            }
        }

        match batch_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Owns one buffering engine and the task running its consumer loop
pub struct BufferedEgress {
    handle: BufferHandle<BufferedEntry>,
    stats: Arc<EgressStats>,
    task: Mutex<Option<JoinHandle<Result<(), BufferError>>>>,
    stopped: CancellationToken,
    sink_name: &'static str,
}

impl BufferedEgress {
    /// Spawns the consumer task on the current tokio runtime
    pub fn start(sink: Arc<dyn EgressSink>, config: BufferConfig, policy: FlushErrorPolicy) -> Self {
        let (engine, handle) = BufferingEngine::new(config, policy);
        let stats = Arc::new(EgressStats::default());
        let sink_name = sink.name();
        let handler = SinkFlushHandler {
            sink,
            stats: Arc::clone(&stats),
        };
        let stopped = CancellationToken::new();
        let task = tokio::spawn({
            let stopped = stopped.clone();
            async move {
                let result = engine.run(handler).await;
                stopped.cancel();
                result
            }
        });
        debug!("EGRESS | Buffered {sink_name} egress started");

        Self {
            handle,
            stats,
            task: Mutex::new(Some(task)),
            stopped,
            sink_name,
        }
    }

    pub async fn enqueue(&self, entry: BufferedEntry) -> Result<(), BufferError> {
        self.handle.enqueue(entry).await
    }

    /// Cloneable producer side of the engine
    pub fn handle(&self) -> BufferHandle<BufferedEntry> {
        self.handle.clone()
    }

    pub fn stats(&self) -> EgressStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolves once the consumer task has exited, whether through [`Self::shutdown`] or
    /// because a flush failure stopped it
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    /// Drains and flushes what is queued, then waits for the consumer task to finish.
    /// Later calls return `Ok(())` immediately.
    pub async fn shutdown(&self) -> Result<(), BufferError> {
        self.handle.shutdown();
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("EGRESS | Buffered {} consumer task failed: {e}", self.sink_name);
                Err(BufferError::Closed)
            }
        };
        debug!(
            "EGRESS | Buffered {} egress stopped: {:?}",
            self.sink_name,
            self.stats()
        );
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::entry::{LogRecordEntry, ResourceContext, Severity};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        sends: StdMutex<Vec<(Option<String>, Vec<String>)>>,
        fail: bool,
        // Service names whose sends fail: with this status, or as unreachable when `None`
        failing: Vec<(&'static str, Option<u16>)>,
    }

    #[async_trait]
    impl EgressSink for RecordingSink {
        async fn send(
            &self,
            batch: Vec<LogRecordEntry>,
            resource: &ResourceContext,
        ) -> Result<EgressOutcome, EgressError> {
            let attempted = batch.len();
            self.sends.lock().unwrap().push((
                resource.service_name.clone(),
                batch.into_iter().map(|e| e.message).collect(),
            ));
            if self.fail {
                return Err(EgressError::BrokerUnavailable("down".to_string()));
            }
            if let Some((_, status)) = self
                .failing
                .iter()
                .find(|(name, _)| resource.service_name.as_deref() == Some(*name))
            {
                return Err(match status {
                    Some(status) => EgressError::Status {
                        status: *status,
                        body: "rejected".to_string(),
                    },
                    None => EgressError::BrokerUnavailable("timeout".to_string()),
                });
            }
            Ok(EgressOutcome::new(attempted, 0))
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn resource(name: &str) -> Arc<ResourceContext> {
        Arc::new(ResourceContext {
            service_name: Some(name.to_string()),
            ..ResourceContext::default()
        })
    }

    fn entry(resource: &Arc<ResourceContext>, message: &str) -> BufferedEntry {
        BufferedEntry {
            resource: Arc::clone(resource),
            entry: LogRecordEntry::new(Severity::Info, message),
        }
    }

    fn config(max_batch_size: usize) -> BufferConfig {
        BufferConfig {
            max_batch_size,
            max_batch_age: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_batches_split_by_resource_runs() {
        let sink = Arc::new(RecordingSink::default());
        let egress = BufferedEgress::start(sink.clone(), config(10), FlushErrorPolicy::Continue);
        let a = resource("a");
        let b = resource("b");

        egress.enqueue(entry(&a, "1")).await.unwrap();
        egress.enqueue(entry(&a, "2")).await.unwrap();
        egress.enqueue(entry(&b, "3")).await.unwrap();
        egress.enqueue(entry(&a, "4")).await.unwrap();
        egress.shutdown().await.unwrap();

        let sends = sink.sends.lock().unwrap().clone();
        assert_eq!(
            sends,
            vec![
                (Some("a".to_string()), vec!["1".to_string(), "2".to_string()]),
                (Some("b".to_string()), vec!["3".to_string()]),
                (Some("a".to_string()), vec!["4".to_string()]),
            ]
        );
        assert_eq!(
            egress.stats(),
            EgressStatsSnapshot {
                batches: 1,
                attempted: 4,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_and_loop_continues() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let egress = BufferedEgress::start(sink.clone(), config(1), FlushErrorPolicy::Continue);
        let a = resource("a");

        egress.enqueue(entry(&a, "1")).await.unwrap();
        egress.enqueue(entry(&a, "2")).await.unwrap();
        egress.shutdown().await.unwrap();

        assert_eq!(sink.sends.lock().unwrap().len(), 2);
        let stats = egress.stats();
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let egress = BufferedEgress::start(sink, config(10), FlushErrorPolicy::Continue);
        egress.shutdown().await.unwrap();

        let result = egress.enqueue(entry(&resource("a"), "late")).await;
        assert!(matches!(result, Err(BufferError::ShuttingDown)));
        assert!(egress.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_run_is_not_masked_by_later_transient_run() {
        let sink = Arc::new(RecordingSink {
            failing: vec![("a", Some(404)), ("b", None)],
            ..RecordingSink::default()
        });
        let egress = BufferedEgress::start(sink.clone(), config(2), FlushErrorPolicy::Continue);
        let a = resource("a");
        let b = resource("b");

        egress.enqueue(entry(&a, "1")).await.unwrap();
        egress.enqueue(entry(&b, "2")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), egress.stopped())
            .await
            .expect("consumer kept running after a fatal flush error");
        let result = egress.enqueue(entry(&b, "3")).await;
        assert!(matches!(result, Err(BufferError::ShuttingDown)));

        match egress.shutdown().await {
            Err(BufferError::Flush(e)) => assert!(e.is_fatal()),
            other => panic!("expected a fatal flush error, got {other:?}"),
        }
        assert_eq!(sink.sends.lock().unwrap().len(), 2);
        assert_eq!(
            egress.stats(),
            EgressStatsSnapshot {
                batches: 1,
                attempted: 2,
                failed: 2
            }
        );
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let egress = BufferedEgress::start(sink, config(10), FlushErrorPolicy::Continue);

        egress.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), egress.stopped())
            .await
            .unwrap();
    }
}
