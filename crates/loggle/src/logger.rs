// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process loggers that ship their own log lines through a buffered sink.
//!
//! A [`LoggerFactory`] owns one [`BufferedEgress`]; every [`Logger`] it hands out only carries
//! its category and a clone of the engine's handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferHandle, FlushErrorPolicy};
use crate::config::{BufferConfig, LoggerOptions};
use crate::egress::buffered::{BufferedEgress, EgressStatsSnapshot};
use crate::egress::EgressSink;
use crate::entry::{BufferedEntry, LogRecordEntry, ResourceContext, Severity};
use crate::errors::BufferError;

pub const CATEGORY_ATTRIBUTE: &str = "category";

#[derive(Clone)]
pub struct Logger {
    category: Arc<str>,
    minimum_level: Severity,
    enabled: bool,
    resource: Arc<ResourceContext>,
    handle: BufferHandle<BufferedEntry>,
}

impl Logger {
    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn is_enabled(&self, level: Severity) -> bool {
        self.enabled && level != Severity::None && level >= self.minimum_level
    }

    /// Queues `message` at `level`. Blank messages and disabled levels are skipped.
    pub async fn log(&self, level: Severity, message: &str) -> Result<(), BufferError> {
        if !self.is_enabled(level) || message.trim().is_empty() {
            return Ok(());
        }
        self.enqueue(level, format!("{level}: {message}")).await
    }

    /// Like [`Logger::log`], with `error` and its chain of sources appended after a blank line
    pub async fn log_error(
        &self,
        level: Severity,
        message: &str,
        error: &(dyn std::error::Error + 'static),
    ) -> Result<(), BufferError> {
        if !self.is_enabled(level) {
            return Ok(());
        }

        let mut text = format!("{level}: {message}\n\n{error}");
        let mut source = error.source();
        while let Some(cause) = source {
            text.push_str(&format!("\nCaused by: {cause}"));
            source = cause.source();
        }
        self.enqueue(level, text).await
    }

    async fn enqueue(&self, level: Severity, message: String) -> Result<(), BufferError> {
        let mut entry = LogRecordEntry::new(level, message);
        entry
            .attributes
            .insert(CATEGORY_ATTRIBUTE.to_string(), self.category.to_string());

        self.handle
            .enqueue(BufferedEntry {
                resource: Arc::clone(&self.resource),
                entry,
            })
            .await
    }
}

pub struct LoggerFactory {
    options: LoggerOptions,
    resource: Arc<ResourceContext>,
    egress: BufferedEgress,
    loggers: Mutex<HashMap<String, Logger>>,
}

impl LoggerFactory {
    /// Starts the shared buffered egress on the current tokio runtime
    pub fn new(options: LoggerOptions, sink: Arc<dyn EgressSink>, buffer: BufferConfig) -> Self {
        let resource = Arc::new(ResourceContext {
            service_name: Some(
                options
                    .service_name
                    .clone()
                    .unwrap_or_else(default_service_name),
            ),
            service_version: Some(options.service_version.clone()),
            ..ResourceContext::default()
        });
        let egress = BufferedEgress::start(sink, buffer, FlushErrorPolicy::Continue);

        Self {
            options,
            resource,
            egress,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the logger for `category`, creating it on first use
    pub fn create_logger(&self, category: &str) -> Logger {
        let build = || Logger {
            category: Arc::from(category),
            minimum_level: self.options.minimum_level,
            enabled: self.options.enabled,
            resource: Arc::clone(&self.resource),
            handle: self.egress.handle(),
        };

        match self.loggers.lock() {
            Ok(mut loggers) => loggers
                .entry(category.to_string())
                .or_insert_with(build)
                .clone(),
            // A poisoned cache only costs the reuse of existing loggers
            Err(_) => build(),
        }
    }

    pub fn resource(&self) -> &ResourceContext {
        &self.resource
    }

    pub fn stats(&self) -> EgressStatsSnapshot {
        self.egress.stats()
    }

    pub async fn shutdown(&self) -> Result<(), BufferError> {
        self.egress.shutdown().await
    }
}

/// `unknown_service:<process name>`, or `unknown_service` when the executable name is unknown
pub fn default_service_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        })
        .map(|process| format!("unknown_service:{process}"))
        .unwrap_or_else(|| "unknown_service".to_string())
}
