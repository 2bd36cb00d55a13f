// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps OTLP log export requests onto [`LogRecordEntry`] values.
//!
//! Decoding is stateless: the same request and limits always produce the same entries. Each
//! resource group yields one shared [`ResourceContext`] and one entry list per scope.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value::Value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs};
use prost::Message;
use serde_json::{Map, Number};

use crate::config::TelemetryLimits;
use crate::entry::{Attributes, LogRecordEntry, ResourceContext, Severity};
use crate::errors::DecodeError;

pub const SERVICE_NAME_KEY: &str = "service.name";
pub const SERVICE_VERSION_KEY: &str = "service.version";
pub const SERVICE_INSTANCE_ID_KEY: &str = "service.instance.id";
pub const ORIGINAL_FORMAT_KEY: &str = "{OriginalFormat}";
pub const PARENT_ID_KEY: &str = "ParentId";
pub const SPAN_ID_KEY: &str = "SpanId";
pub const TRACE_ID_KEY: &str = "TraceId";

/// Parses a protobuf encoded `ExportLogsServiceRequest`
pub fn decode_request(body: &[u8]) -> Result<ExportLogsServiceRequest, DecodeError> {
    Ok(ExportLogsServiceRequest::decode(body)?)
}

#[derive(Clone, Debug)]
pub struct DecodedResourceLogs {
    pub resource: Arc<ResourceContext>,
    pub scopes: Vec<DecodedScopeLogs>,
}

#[derive(Clone, Debug)]
pub struct DecodedScopeLogs {
    pub scope_name: String,
    pub scope_version: String,
    pub entries: Vec<LogRecordEntry>,
}

impl DecodedResourceLogs {
    pub fn entry_count(&self) -> usize {
        self.scopes.iter().map(|scope| scope.entries.len()).sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct TelemetryDecoder {
    limits: TelemetryLimits,
}

impl TelemetryDecoder {
    pub fn new(limits: TelemetryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &TelemetryLimits {
        &self.limits
    }

    pub fn decode(&self, request: &ExportLogsServiceRequest) -> Vec<DecodedResourceLogs> {
        request
            .resource_logs
            .iter()
            .map(|resource_logs| self.decode_resource_logs(resource_logs))
            .collect()
    }

    fn decode_resource_logs(&self, resource_logs: &ResourceLogs) -> DecodedResourceLogs {
        let resource = Arc::new(self.decode_resource(
            resource_logs
                .resource
                .as_ref()
                .map(|resource| resource.attributes.as_slice())
                .unwrap_or_default(),
        ));

        let scopes = resource_logs
            .scope_logs
            .iter()
            .map(|scope_logs| {
                let (scope_name, scope_version) = scope_logs
                    .scope
                    .as_ref()
                    .map(|scope| (scope.name.clone(), scope.version.clone()))
                    .unwrap_or_default();
                DecodedScopeLogs {
                    scope_name,
                    scope_version,
                    entries: scope_logs
                        .log_records
                        .iter()
                        .map(|record| self.decode_record(record))
                        .collect(),
                }
            })
            .collect();

        DecodedResourceLogs { resource, scopes }
    }

    /// Extracts the service identity keys and keeps every other attribute in arrival order.
    /// All values are truncated. The attribute count limit does not apply to resources.
    pub fn decode_resource(&self, attributes: &[KeyValue]) -> ResourceContext {
        let mut resource = ResourceContext {
            attributes: Attributes::with_capacity(attributes.len()),
            ..ResourceContext::default()
        };

        for attribute in attributes {
            let value = truncate(
                any_value_to_string(attribute.value.as_ref()),
                self.limits.max_attribute_length,
            );
            match attribute.key.as_str() {
                SERVICE_NAME_KEY => resource.service_name = Some(value),
                SERVICE_VERSION_KEY => resource.service_version = Some(value),
                SERVICE_INSTANCE_ID_KEY => resource.service_instance_id = Some(value),
                _ => {
                    resource.attributes.insert(attribute.key.clone(), value);
                }
            }
        }

        resource
    }

    pub fn decode_record(&self, record: &LogRecord) -> LogRecordEntry {
        let mut attributes =
            Attributes::with_capacity(record.attributes.len().min(self.limits.max_attribute_count));
        let mut original_format = None;
        let mut parent_id = String::new();

        for attribute in &record.attributes {
            match attribute.key.as_str() {
                ORIGINAL_FORMAT_KEY => {
                    original_format = Some(any_value_to_string(attribute.value.as_ref()));
                }
                PARENT_ID_KEY => parent_id = any_value_to_string(attribute.value.as_ref()),
                SPAN_ID_KEY | TRACE_ID_KEY => {}
                key => {
                    // Past the limit only keys that were already admitted may be overwritten
                    if attributes.len() >= self.limits.max_attribute_count
                        && !attributes.contains_key(key)
                    {
                        continue;
                    }
                    let value = truncate(
                        any_value_to_string(attribute.value.as_ref()),
                        self.limits.max_attribute_length,
                    );
                    attributes.insert(key.to_string(), value);
                }
            }
        }

        LogRecordEntry {
            timestamp: resolve_timestamp(record.time_unix_nano, record.observed_time_unix_nano),
            severity: Severity::from_severity_number(record.severity_number),
            message: truncate(
                any_value_to_string(record.body.as_ref()),
                self.limits.max_attribute_length,
            ),
            attributes,
            span_id: hex::encode(&record.span_id),
            trace_id: hex::encode(&record.trace_id),
            parent_id,
            original_format,
            flags: record.flags,
        }
    }
}

/// Uses the record time when set, otherwise the observed time.
/// Nanosecond values beyond the range of `i64` saturate.
pub fn resolve_timestamp(time_unix_nano: u64, observed_time_unix_nano: u64) -> DateTime<Utc> {
    let nanos = if time_unix_nano != 0 {
        time_unix_nano
    } else {
        observed_time_unix_nano
    };
    DateTime::from_timestamp_nanos(i64::try_from(nanos).unwrap_or(i64::MAX))
}

/// Shortens `value` to at most `max_length` characters, never splitting a character
pub fn truncate(mut value: String, max_length: Option<usize>) -> String {
    if let Some(max_length) = max_length {
        if let Some((byte_index, _)) = value.char_indices().nth(max_length) {
            value.truncate(byte_index);
        }
    }
    value
}

/// Renders an OTLP value as text. Scalars use their plain form, byte arrays lowercase hex,
/// arrays and key/value lists compact JSON. A missing value renders as an empty string.
pub fn any_value_to_string(value: Option<&AnyValue>) -> String {
    match value.and_then(|v| v.value.as_ref()) {
        None => String::new(),
        Some(Value::StringValue(s)) => s.clone(),
        Some(Value::BoolValue(b)) => b.to_string(),
        Some(Value::IntValue(i)) => i.to_string(),
        Some(Value::DoubleValue(d)) => d.to_string(),
        Some(Value::BytesValue(bytes)) => hex::encode(bytes),
        Some(composite @ (Value::ArrayValue(_) | Value::KvlistValue(_))) => {
            value_to_json(Some(composite)).to_string()
        }
    }
}

fn value_to_json(value: Option<&Value>) -> serde_json::Value {
    match value {
        None => serde_json::Value::Null,
        Some(Value::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Value::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Value::IntValue(i)) => serde_json::Value::Number(Number::from(*i)),
        Some(Value::DoubleValue(d)) => Number::from_f64(*d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Value::BytesValue(bytes)) => serde_json::Value::String(hex::encode(bytes)),
        Some(Value::ArrayValue(array)) => serde_json::Value::Array(
            array
                .values
                .iter()
                .map(|v| value_to_json(v.value.as_ref()))
                .collect(),
        ),
        Some(Value::KvlistValue(list)) => {
            let mut map = Map::with_capacity(list.values.len());
            for kv in &list.values {
                map.insert(
                    kv.key.clone(),
                    value_to_json(kv.value.as_ref().and_then(|v| v.value.as_ref())),
                );
            }
            serde_json::Value::Object(map)
        }
    }
}
