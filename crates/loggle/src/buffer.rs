// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded size/age batching between many producers and a single consumer.
//!
//! [`BufferingEngine::new`] returns the engine together with a cloneable [`BufferHandle`].
//! Producers call [`BufferHandle::enqueue`], which waits while the queue is full instead of
//! dropping. The engine is consumed by [`BufferingEngine::run`], so only one consumer loop can
//! exist per engine.
//!
//! The consumer accumulates items into a batch and hands it to a [`FlushHandler`] when either:
//! - the batch reaches `max_batch_size`, or
//! - `max_batch_age` has elapsed since the first item of the batch was accumulated.
//!
//! An empty batch never expires. On shutdown the consumer stops waiting, drains what is left
//! in the queue, flushes it, and returns.

use std::mem;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::BufferConfig;
use crate::errors::{BufferError, FlushError};

/// What the consumer loop does when a flush handler returns a transient error.
/// Fatal errors always stop the loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlushErrorPolicy {
    /// Log the error and keep accumulating the next batch
    #[default]
    Continue,
    /// Stop the loop and return the error from [`BufferingEngine::run`]
    Terminate,
}

/// Receives each batch by value. Runs on the consumer task, so no new batch is accumulated
/// until it returns.
#[async_trait]
pub trait FlushHandler<T>: Send {
    async fn flush(&mut self, batch: Vec<T>) -> Result<(), FlushError>;
}

#[derive(Debug)]
pub struct BufferHandle<T> {
    tx: mpsc::Sender<T>,
    cancel_token: CancellationToken,
}

impl<T> Clone for BufferHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }
}

impl<T: Send> BufferHandle<T> {
    /// Queues `item`, waiting for space while the queue is full.
    ///
    /// Fails with [`BufferError::ShuttingDown`] once shutdown has been requested, including
    /// while waiting for space, and with [`BufferError::Closed`] if the consumer is gone.
    pub async fn enqueue(&self, item: T) -> Result<(), BufferError> {
        if self.cancel_token.is_cancelled() {
            return Err(BufferError::ShuttingDown);
        }
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => Err(BufferError::ShuttingDown),
            sent = self.tx.send(item) => sent.map_err(|_| BufferError::Closed),
        }
    }

    /// Asks the consumer to drain, flush and stop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

enum Event<T> {
    Item(T),
    Expired,
    Stop,
}

pub struct BufferingEngine<T> {
    config: BufferConfig,
    policy: FlushErrorPolicy,
    rx: mpsc::Receiver<T>,
    cancel_token: CancellationToken,
}

impl<T: Send> BufferingEngine<T> {
    pub fn new(config: BufferConfig, policy: FlushErrorPolicy) -> (Self, BufferHandle<T>) {
        // mpsc::channel panics on a zero capacity
        let capacity = config.max_batch_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let cancel_token = CancellationToken::new();

        let engine = Self {
            config,
            policy,
            rx,
            cancel_token: cancel_token.clone(),
        };
        let handle = BufferHandle { tx, cancel_token };

        (engine, handle)
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }

    /// Runs the consumer loop until shutdown is requested or every handle has been dropped.
    ///
    /// Returns an error only when a flush fails fatally, or fails at all under
    /// [`FlushErrorPolicy::Terminate`]. Producers see [`BufferError::ShuttingDown`] from then on.
    pub async fn run<H: FlushHandler<T>>(mut self, mut handler: H) -> Result<(), BufferError> {
        debug!(
            "BUFFER | Consumer started: max_batch_size={}, max_batch_age={:?}",
            self.max_batch_size(),
            self.config.max_batch_age
        );

        let mut batch: Vec<T> = Vec::with_capacity(self.max_batch_size());
        let mut deadline: Option<Instant> = None;

        loop {
            let event = match deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    () = self.cancel_token.cancelled() => Event::Stop,
                    item = self.rx.recv() => item.map_or(Event::Stop, Event::Item),
                    () = sleep_until(deadline) => Event::Expired,
                },
                None => tokio::select! {
                    biased;
                    () = self.cancel_token.cancelled() => Event::Stop,
                    item = self.rx.recv() => item.map_or(Event::Stop, Event::Item),
                },
            };

            match event {
                Event::Item(item) => {
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + self.config.max_batch_age);
                    }
                    batch.push(item);
                    if batch.len() >= self.max_batch_size() {
                        deadline = None;
                        self.flush(&mut handler, &mut batch).await?;
                    }
                }
                Event::Expired => {
                    deadline = None;
                    self.flush(&mut handler, &mut batch).await?;
                }
                Event::Stop => break,
            }
        }

        self.drain(&mut handler, batch).await
    }

    async fn drain<H: FlushHandler<T>>(
        &mut self,
        handler: &mut H,
        mut batch: Vec<T>,
    ) -> Result<(), BufferError> {
        self.cancel_token.cancel();
        self.rx.close();

        while let Ok(item) = self.rx.try_recv() {
            batch.push(item);
            if batch.len() >= self.max_batch_size() {
                self.flush(handler, &mut batch).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(handler, &mut batch).await?;
        }

        debug!("BUFFER | Consumer stopped");
        Ok(())
    }

    async fn flush<H: FlushHandler<T>>(
        &self,
        handler: &mut H,
        batch: &mut Vec<T>,
    ) -> Result<(), BufferError> {
        let ready = mem::replace(batch, Vec::with_capacity(self.max_batch_size()));
        let size = ready.len();
        debug!("BUFFER | Flushing batch of {size} items");

        match handler.flush(ready).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() || self.policy == FlushErrorPolicy::Terminate => {
                error!("BUFFER | Flush of {size} items failed, stopping consumer: {e}");
                self.cancel_token.cancel();
                Err(BufferError::Flush(e))
            }
            Err(e) => {
                warn!("BUFFER | Flush of {size} items failed: {e}");
                Ok(())
            }
        }
    }
}
