// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use loggle::decoder::decode_request;
use loggle::errors::IngestError;
use loggle::orchestrator::IngestionOrchestrator;

use crate::config::ReceiverConfig;
use crate::http_utils::{
    create_protobuf_response, is_protobuf_content_type, log_and_create_http_response,
    verify_request_content_length, HttpResponse,
};

pub const OTLP_LOGS_ENDPOINT_PATH: &str = "/v1/logs";
pub const INGEST_ENDPOINT_PATH: &str = "/api/v1/logs/ingest";
const ERROR_MESSAGE_PREFIX: &str = "Error processing logs";
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP status returned to the client for an ingestion failure
pub fn status_for(error: &IngestError) -> StatusCode {
    match error {
        IngestError::Decode(_) | IngestError::CapacityExceeded { .. } => StatusCode::BAD_REQUEST,
        IngestError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        IngestError::Egress(_) => StatusCode::INTERNAL_SERVER_ERROR,
        IngestError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub struct IngestServer {
    config: ReceiverConfig,
    orchestrator: Arc<IngestionOrchestrator>,
    cancel_token: CancellationToken,
}

impl IngestServer {
    pub fn new(
        config: ReceiverConfig,
        orchestrator: Arc<IngestionOrchestrator>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            orchestrator,
            cancel_token,
        }
    }

    /// Binds the configured address and serves until the cancellation token fires
    pub async fn start(&self) -> io::Result<()> {
        let now = Instant::now();
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        debug!(
            "INGEST | Listening on {}:{}, took {} ms to bind",
            self.config.host,
            self.config.port,
            now.elapsed().as_millis()
        );
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until the cancellation token fires, then waits for
    /// in-flight requests to complete
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let cancel_token = self.cancel_token.clone();
        let max_content_length = self.config.max_request_content_length;

        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let orchestrator = Arc::clone(&orchestrator);
            let cancel_token = cancel_token.clone();
            async move {
                handle_request(req, &orchestrator, max_content_length, &cancel_token).await
            }
        });

        let server = hyper::server::conn::http1::Builder::new();
        let graceful = GracefulShutdown::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("INGEST | Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("INGEST | Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let connection = server.serve_connection(TokioIo::new(conn), service.clone());
            let connection = graceful.watch(connection);
            joinset.spawn(async move {
                if let Err(e) = connection.await {
                    debug!("INGEST | Connection error: {e}");
                }
            });
        }

        drop(listener);
        debug!("INGEST | Stopped accepting connections");
        tokio::select! {
            () = graceful.shutdown() => debug!("INGEST | All connections closed"),
            () = tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT) => {
                warn!("INGEST | Timed out waiting for open connections to close");
            }
        }
        Ok(())
    }
}

async fn handle_request<B>(
    req: Request<B>,
    orchestrator: &IngestionOrchestrator,
    max_content_length: usize,
    cancel_token: &CancellationToken,
) -> http::Result<HttpResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, OTLP_LOGS_ENDPOINT_PATH | INGEST_ENDPOINT_PATH) => {
            if cancel_token.is_cancelled() {
                return error_response(&IngestError::ShuttingDown);
            }
            match ingest(req, orchestrator, max_content_length).await {
                Ok(response) => Ok(response),
                Err(e) => error_response(&e),
            }
        }
        (_, OTLP_LOGS_ENDPOINT_PATH | INGEST_ENDPOINT_PATH) => log_and_create_http_response(
            &format!("{ERROR_MESSAGE_PREFIX}: Method {} not allowed", req.method()),
            StatusCode::METHOD_NOT_ALLOWED,
        ),
        _ => {
            let mut not_found = Response::default();
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

async fn ingest<B>(
    req: Request<B>,
    orchestrator: &IngestionOrchestrator,
    max_content_length: usize,
) -> Result<HttpResponse, IngestError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();

    if !is_protobuf_content_type(&parts.headers) {
        let content_type = parts
            .headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("<none>");
        return Err(IngestError::UnsupportedMediaType(content_type.to_string()));
    }

    if let Some(response) =
        verify_request_content_length(&parts.headers, max_content_length, ERROR_MESSAGE_PREFIX)
    {
        return response.or_else(|e| {
            error!("INGEST | Failed to build response: {e}");
            Ok(Response::default())
        });
    }

    let body = match Limited::new(body, max_content_length).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(IngestError::CapacityExceeded {
                limit: max_content_length,
            });
        }
        Err(e) => {
            return log_and_create_http_response(
                &format!("{ERROR_MESSAGE_PREFIX}: Failed to read request body: {e}"),
                StatusCode::BAD_REQUEST,
            )
            .or_else(|_| Ok(Response::default()));
        }
    };

    let request = decode_request(&body)?;
    let outcome = orchestrator.ingest(&request).await?;
    debug!(
        "INGEST | Request of {} bytes: accepted={}, rejected={}",
        body.len(),
        outcome.accepted,
        outcome.rejected
    );
    create_protobuf_response(&outcome.into_response(), StatusCode::OK).or_else(|e| {
        error!("INGEST | Failed to build response: {e}");
        Ok(Response::default())
    })
}

fn error_response(error: &IngestError) -> http::Result<HttpResponse> {
    log_and_create_http_response(
        &format!("{ERROR_MESSAGE_PREFIX}: {error}"),
        status_for(error),
    )
}
