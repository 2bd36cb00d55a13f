// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use loggle::orchestrator::IngestionOrchestrator;
use loggle_agent::config::ReceiverConfig;
use loggle_agent::ingest_server::IngestServer;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value::Value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const PROTOBUF: &str = "application/x-protobuf";

pub struct RunningServer {
    pub addr: SocketAddr,
    pub cancel_token: CancellationToken,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Serve `orchestrator` on a random local port
pub async fn start_ingest_server(
    orchestrator: Arc<IngestionOrchestrator>,
    max_request_content_length: usize,
) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind ingest server");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let cancel_token = CancellationToken::new();
    let config = ReceiverConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        max_request_content_length,
    };

    let server = IngestServer::new(config, orchestrator, cancel_token.clone());
    let handle = tokio::spawn(async move { server.serve(listener).await });

    RunningServer {
        addr,
        cancel_token,
        handle,
    }
}

fn string_value(value: &str) -> Option<AnyValue> {
    Some(AnyValue {
        value: Some(Value::StringValue(value.to_string())),
    })
}

/// One resource group for `service_name` holding one Info record per message
pub fn create_test_logs_request(service_name: &str, messages: &[&str]) -> ExportLogsServiceRequest {
    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(Resource {
                attributes: vec![KeyValue {
                    key: "service.name".to_string(),
                    value: string_value(service_name),
                }],
                ..Default::default()
            }),
            scope_logs: vec![ScopeLogs {
                log_records: messages
                    .iter()
                    .map(|message| LogRecord {
                        time_unix_nano: 1_700_000_000_000_000_000,
                        severity_number: 9,
                        body: string_value(message),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

pub fn create_test_logs_payload(service_name: &str, messages: &[&str]) -> Vec<u8> {
    create_test_logs_request(service_name, messages).encode_to_vec()
}

/// POST `body` to the ingest server and return the response
pub async fn post_logs(
    server: &RunningServer,
    path: &str,
    content_type: &str,
    body: Vec<u8>,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(server.url(path))
        .header("Content-Type", content_type)
        .body(body)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request to ingest server")
}
