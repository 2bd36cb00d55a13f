// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalized log entities produced by the decoder and consumed by egress sinks.
//!
//! A [`LogRecordEntry`] is built once per OTLP log record and never mutated afterwards.
//! The [`ResourceContext`] describing the emitting service is decoded once per resource
//! group and shared through an [`Arc`] by every entry of that group.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

/// Six-level severity plus `None` for records that carry no severity number.
///
/// Variants are ordered from least to most severe so that a minimum level can be compared
/// with `>=`. `None` sorts last and is never considered enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(alias = "trace", alias = "TRACE")]
    Trace,
    #[serde(alias = "debug", alias = "DEBUG")]
    Debug,
    #[serde(alias = "info", alias = "INFO", alias = "Information", alias = "information")]
    Info,
    #[serde(alias = "warn", alias = "WARN", alias = "Warning", alias = "warning")]
    Warn,
    #[serde(alias = "error", alias = "ERROR")]
    Error,
    #[serde(alias = "fatal", alias = "FATAL", alias = "Critical", alias = "critical")]
    Fatal,
    #[serde(alias = "none", alias = "NONE")]
    None,
}

impl Severity {
    /// Maps an OTLP severity number onto its band. 0 and anything outside 1..=24 map to `None`.
    pub fn from_severity_number(number: i32) -> Self {
        match number {
            1..=4 => Severity::Trace,
            5..=8 => Severity::Debug,
            9..=12 => Severity::Info,
            13..=16 => Severity::Warn,
            17..=20 => Severity::Error,
            21..=24 => Severity::Fatal,
            _ => Severity::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "Trace",
            Severity::Debug => "Debug",
            Severity::Info => "Info",
            Severity::Warn => "Warn",
            Severity::Error => "Error",
            Severity::Fatal => "Fatal",
            Severity::None => "None",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insertion-ordered string map with unique keys.
///
/// Re-inserting an existing key replaces its value in place and keeps its original position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Inserts or overwrites `key`. Returns true when the key was not present before.
    pub fn insert(&mut self, key: String, value: String) -> bool {
        if let Some(&position) = self.index.get(&key) {
            self.entries[position].1 = value;
            return false;
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, value));
        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(key)
            .map(|&position| self.entries[position].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

struct NamedValue<'a>(&'a str, &'a str);

impl Serialize for NamedValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("name", self.0)?;
        map.serialize_entry("value", self.1)?;
        map.end()
    }
}

// Rendered as `[{"name": ..., "value": ...}]` so documents keep a fixed mapping in the index
// no matter which attribute keys producers send.
impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            seq.serialize_element(&NamedValue(name, value))?;
        }
        seq.end()
    }
}

/// Describes the process that emitted a group of log records
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceContext {
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub service_instance_id: Option<String>,
    /// Every resource attribute other than the three service keys, in arrival order
    pub attributes: Attributes,
}

/// One normalized log record
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecordEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub attributes: Attributes,
    pub span_id: String,
    pub trace_id: String,
    pub parent_id: String,
    pub original_format: Option<String>,
    pub flags: u32,
}

impl LogRecordEntry {
    /// Entry with the given severity and message, stamped now and carrying no attributes or ids
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            attributes: Attributes::new(),
            span_id: String::new(),
            trace_id: String::new(),
            parent_id: String::new(),
            original_format: None,
            flags: 0,
        }
    }
}

/// A log entry queued for asynchronous egress together with the resource it was decoded from
#[derive(Clone, Debug)]
pub struct BufferedEntry {
    pub resource: Arc<ResourceContext>,
    pub entry: LogRecordEntry,
}
