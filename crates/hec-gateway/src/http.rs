// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{
    header,
    http::{self, HeaderMap},
    Method, Request, Response, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::{AckError, GatewayError};
use crate::service::HecService;
use crate::syslog::HeaderInfo;

pub const COLLECTOR_PATH: &str = "/services/collector";
pub const EVENT_PATH: &str = "/services/collector/event";
pub const EVENT_V1_PATH: &str = "/services/collector/event/1.0";
pub const ACK_PATH: &str = "/services/collector/ack";
pub const HEALTH_PATH: &str = "/services/collector/health";

const CHANNEL_HEADER: &str = "x-splunk-request-channel";
const CHANNEL_QUERY_PARAM: &str = "channel";
const TOKEN_SCHEME: &str = "Splunk ";

const CODE_TOKEN_REQUIRED: u8 = 2;
const CODE_NO_DATA: u8 = 5;
const CODE_INVALID_DATA_FORMAT: u8 = 6;
const CODE_INTERNAL_ERROR: u8 = 8;
const CODE_SERVER_BUSY: u8 = 9;
const CODE_CHANNEL_MISSING: u8 = 10;
const CODE_INVALID_CHANNEL: u8 = 11;
const CODE_EVENT_FIELD_REQUIRED: u8 = 12;
const CODE_EVENT_FIELD_BLANK: u8 = 13;
const CODE_HEALTHY: u8 = 17;

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. Server errors are logged at error level, anything else at debug.
/// 2. Returns the given message in the body of a JSON response with the given status code.
///
/// Response body format:
/// {
///     "text": message,
///     "code": code
/// }
pub fn log_and_create_http_response(
    message: &str,
    code: u8,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_server_error() {
        error!("{message}");
    } else {
        debug!("{message}");
    }
    let body = json!({ "text": message, "code": code }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::from(body))
}

fn create_json_response<T: Serialize>(status: StatusCode, body: &T) -> http::Result<HttpResponse> {
    match serde_json::to_string(body) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::from(body)),
        Err(e) => log_and_create_http_response(
            &format!("Failed to serialize response: {e}"),
            CODE_INTERNAL_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Maps an ingestion error to its status code and HEC body code.
pub fn error_status(err: &GatewayError) -> (StatusCode, u8) {
    match err {
        GatewayError::AuthenticationTokenMissing => {
            (StatusCode::UNAUTHORIZED, CODE_TOKEN_REQUIRED)
        }
        GatewayError::ChannelNotProvided => (StatusCode::BAD_REQUEST, CODE_CHANNEL_MISSING),
        GatewayError::NoData => (StatusCode::BAD_REQUEST, CODE_NO_DATA),
        GatewayError::InvalidJson(_) => (StatusCode::BAD_REQUEST, CODE_INVALID_DATA_FORMAT),
        GatewayError::EventFieldMissing => {
            (StatusCode::BAD_REQUEST, CODE_EVENT_FIELD_REQUIRED)
        }
        GatewayError::EventFieldBlank => (StatusCode::BAD_REQUEST, CODE_EVENT_FIELD_BLANK),
        GatewayError::Ack(AckError::InvalidAckId(_)) => {
            (StatusCode::BAD_REQUEST, CODE_INVALID_DATA_FORMAT)
        }
        GatewayError::Ack(AckError::SessionNotFound | AckError::ChannelNotFound) => {
            (StatusCode::NOT_FOUND, CODE_INVALID_CHANNEL)
        }
        GatewayError::Ack(AckError::ServerBusy { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, CODE_SERVER_BUSY)
        }
        GatewayError::Sender(_) => (StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL_ERROR),
    }
}

fn error_response(err: &GatewayError) -> http::Result<HttpResponse> {
    let (status, code) = error_status(err);
    log_and_create_http_response(&err.to_string(), code, status)
}

/// Takes a request's header map, and verifies that the "content-length" and/or "Transfer-Encoding" header
/// is present, valid, and less than the given max_content_length.
///
/// Will return None if no issues are found. Otherwise logs an error (with the given prefix) and
/// returns and HTTP Response with the appropriate error status code.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let content_length_header = match header_map.get(header::CONTENT_LENGTH) {
        Some(res) => res,
        None => {
            if let Some(transfer_encoding_header) = header_map.get(header::TRANSFER_ENCODING) {
                debug!(
                    "Transfer-Encoding header is present: {:?}",
                    transfer_encoding_header
                );
                return None;
            }
            return Some(log_and_create_http_response(
                &format!(
                    "{error_message_prefix}: Missing Content-Length and Transfer-Encoding header"
                ),
                CODE_NO_DATA,
                StatusCode::LENGTH_REQUIRED,
            ));
        }
    };
    let content_length = match content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        Some(res) => res,
        None => {
            return Some(log_and_create_http_response(
                &format!("{error_message_prefix}: Invalid Content-Length header"),
                CODE_INVALID_DATA_FORMAT,
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Payload too large"),
            CODE_INVALID_DATA_FORMAT,
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}

/// Token from the `Authorization` header, with an optional `Splunk ` scheme stripped.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim_start();
    let token = match value.get(..TOKEN_SCHEME.len()) {
        Some(scheme) if scheme.eq_ignore_ascii_case(TOKEN_SCHEME) => &value[TOKEN_SCHEME.len()..],
        _ => value,
    };
    Some(token.trim().to_string())
}

/// Channel from the request channel header, or else from the `channel` query parameter.
pub fn extract_channel(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(CHANNEL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(channel) = from_header {
        return Some(channel.to_string());
    }
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == CHANNEL_QUERY_PARAM)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// HTTP front end of the gateway.
pub struct HecServer {
    service: Arc<HecService>,
    max_request_content_length: usize,
}

impl HecServer {
    pub fn new(service: Arc<HecService>, max_request_content_length: usize) -> Self {
        Self {
            service,
            max_request_content_length,
        }
    }

    /// Serves requests accepted on `listener` until `cancel` fires.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let hec_service = self.service.clone();
        let max_request_content_length = self.max_request_content_length;
        let service = service_fn(move |req: Request<Incoming>| {
            // called for each http request
            let hec_service = hec_service.clone();
            HecServer::endpoint_handler(hec_service, max_request_content_length, req)
        });

        if let Ok(addr) = listener.local_addr() {
            debug!("HEC gateway listening on {addr}");
        }

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
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
                        error!("Server error: {e}");
                        return Err(e.into());
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
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                () = cancel.cancelled() => {
                    debug!("HEC gateway shutting down, dropping {} connections", joinset.len());
                    return Ok(());
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    error!("Connection error: {e}");
                }
            });
        }
    }

    async fn endpoint_handler(
        service: Arc<HecService>,
        max_request_content_length: usize,
        req: Request<Incoming>,
    ) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (&Method::POST, COLLECTOR_PATH | EVENT_PATH | EVENT_V1_PATH) => {
                Self::events_handler(service, max_request_content_length, req).await
            }
            (&Method::POST, ACK_PATH) => {
                Self::ack_handler(service, max_request_content_length, req).await
            }
            (&Method::GET, HEALTH_PATH) => log_and_create_http_response(
                "HEC is healthy",
                CODE_HEALTHY,
                StatusCode::OK,
            ),
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn events_handler(
        service: Arc<HecService>,
        max_request_content_length: usize,
        req: Request<Incoming>,
    ) -> http::Result<HttpResponse> {
        let (parts, body) = req.into_parts();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            max_request_content_length,
            "Error processing events",
        ) {
            return response;
        }
        let token = extract_token(&parts.headers);
        let channel = extract_channel(&parts.headers, parts.uri.query());
        let origin = HeaderInfo::from_headers(&parts.headers);
        let body = match Self::read_body(body, max_request_content_length).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        match service
            .send_events(token.as_deref(), channel.as_deref(), &body, &origin)
            .await
        {
            Ok(response) => create_json_response(StatusCode::OK, &response),
            Err(e) => error_response(&e),
        }
    }

    async fn ack_handler(
        service: Arc<HecService>,
        max_request_content_length: usize,
        req: Request<Incoming>,
    ) -> http::Result<HttpResponse> {
        let (parts, body) = req.into_parts();
        if let Some(response) = verify_request_content_length(
            &parts.headers,
            max_request_content_length,
            "Error processing ack request",
        ) {
            return response;
        }
        let token = extract_token(&parts.headers);
        let channel = extract_channel(&parts.headers, parts.uri.query());
        let body = match Self::read_body(body, max_request_content_length).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        match service.get_acks(token.as_deref(), channel.as_deref(), &body) {
            Ok(response) => create_json_response(StatusCode::OK, &response),
            Err(e) => error_response(&e),
        }
    }

    /// Buffers at most `max_request_content_length` bytes of `body`, whatever the framing.
    async fn read_body<B>(
        body: B,
        max_request_content_length: usize,
    ) -> Result<Bytes, http::Result<HttpResponse>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match Limited::new(body, max_request_content_length).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.is::<LengthLimitError>() => Err(log_and_create_http_response(
                "Error reading request body: Payload too large",
                CODE_INVALID_DATA_FORMAT,
                StatusCode::PAYLOAD_TOO_LARGE,
            )),
            Err(e) => Err(log_and_create_http_response(
                &format!("Error reading request body: {e}"),
                CODE_INVALID_DATA_FORMAT,
                StatusCode::BAD_REQUEST,
            )),
        }
    }
}
