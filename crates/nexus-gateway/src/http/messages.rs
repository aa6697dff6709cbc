//! `POST /v1/messages` — the proxy's single entry point (spec §4.9, C9).

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::StreamExt;
use nexus_core::error::ProxyError;
use nexus_core::model::{ChatRequest, ChatResponse};
use nexus_core::types::{AccountId, Domain, RequestId};
use nexus_storage::{RequestRecord, ResponseRecord, StreamingChunkRecord};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::http::error_envelope;

pub async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = RequestId::new();

    let domain = resolve_domain(&headers);
    info!(request_id = %request_id, domain = %domain, "received /v1/messages");

    let credential = match state.credentials.resolve(&domain).await {
        Ok(c) => c,
        Err(e) => return error_response(&e, &request_id),
    };

    if !content_type_is_json(&headers) {
        let e = ProxyError::Validation("content-type must be application/json".to_string());
        return error_response(&e, &request_id);
    }

    let body_value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let e = ProxyError::Validation(format!("invalid request body: {e}"));
            return error_response(&e, &request_id);
        }
    };
    let request: ChatRequest = match serde_json::from_value(body_value.clone()) {
        Ok(r) => r,
        Err(e) => {
            let e = ProxyError::Validation(format!("missing required field: {e}"));
            return error_response(&e, &request_id);
        }
    };

    let link = state.linker.link(&domain, &request.messages, &request.system).await;
    let account_id = AccountId::from(domain.as_str());

    let request_record = RequestRecord {
        request_id: request_id.clone(),
        domain: domain.clone(),
        account_id: account_id.clone(),
        timestamp: Utc::now(),
        body: body_value,
        conversation_id: link.conversation_id.clone(),
        branch_id: link.branch_id.clone(),
        parent_request_id: link.parent_request_id.clone(),
        current_message_hash: link.current_message_hash.clone(),
        parent_message_hash: link.parent_message_hash.clone(),
        system_hash: link.system_hash.clone(),
        message_count: request.messages.len() as u32,
        is_subtask: link.is_subtask,
        parent_task_request_id: link.parent_task_request_id.clone(),
    };
    state.writer.enqueue_request(request_record).await;

    let outcome = state.upstream.send(&body, &credential).await;
    let outcome = match outcome {
        nexus_upstream::UpstreamOutcome::AuthExpired => {
            warn!(request_id = %request_id, "upstream reported expired credential, refreshing");
            match state.credentials.force_refresh(&domain).await {
                Ok(refreshed) => state.upstream.send(&body, &refreshed).await,
                Err(e) => return error_response(&e, &request_id),
            }
        }
        other => other,
    };

    match outcome {
        nexus_upstream::UpstreamOutcome::Ok(resp) => {
            if request.stream {
                handle_streaming(state, resp, request_id, domain, account_id).await
            } else {
                handle_non_streaming(state, resp, request_id, domain, account_id).await
            }
        }
        nexus_upstream::UpstreamOutcome::RateLimited { retry_after_ms } => {
            let err = ProxyError::RateLimited { retry_after_ms };
            persist_failed_response(&state, &request_id, domain, account_id, err.status_code(), &err).await;
            let mut response = error_envelope(&err, request_id.as_str()).into_response();
            *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            let retry_after_secs = (retry_after_ms / 1000).max(1).to_string();
            if let Ok(value) = retry_after_secs.parse() {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
        nexus_upstream::UpstreamOutcome::UpstreamError { status, body } => {
            let body_value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            persist_response(&state, &request_id, domain, account_id, status, body_value).await;
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        nexus_upstream::UpstreamOutcome::Timeout => {
            let err = ProxyError::Timeout { ms: state.config.upstream.timeout_ms };
            persist_failed_response(&state, &request_id, domain, account_id, err.status_code(), &err).await;
            error_response(&err, &request_id)
        }
        nexus_upstream::UpstreamOutcome::Network(msg) => {
            let err = ProxyError::Network(msg);
            persist_failed_response(&state, &request_id, domain, account_id, err.status_code(), &err).await;
            error_response(&err, &request_id)
        }
        nexus_upstream::UpstreamOutcome::AuthExpired => {
            // Only reachable if the retried send also reported AuthExpired.
            let err = ProxyError::ExpiredToken { domain: domain.as_str().to_string() };
            persist_failed_response(&state, &request_id, domain, account_id, err.status_code(), &err).await;
            error_response(&err, &request_id)
        }
    }
}

/// Persists a ResponseRecord for an outcome that never produced an upstream
/// body (rate limit, timeout, network failure, expired credential) so the
/// conversation graph has no silent gaps (spec §4.9 step 9).
async fn persist_failed_response(
    state: &AppState,
    request_id: &RequestId,
    domain: Domain,
    account_id: AccountId,
    status: u16,
    err: &ProxyError,
) {
    let body = serde_json::json!({ "error": { "type": err.code(), "message": err.to_string() } });
    persist_response(state, request_id, domain, account_id, status, body).await;
}

async fn persist_response(
    state: &AppState,
    request_id: &RequestId,
    domain: Domain,
    account_id: AccountId,
    status: u16,
    body: Value,
) {
    let record = ResponseRecord {
        request_id: request_id.clone(),
        domain: domain.clone(),
        account_id,
        status,
        body,
        input_tokens: 0,
        output_tokens: 0,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: 0,
        timestamp: Utc::now(),
    };
    state.writer.enqueue_response(record, domain).await;
}

async fn handle_non_streaming(
    state: Arc<AppState>,
    resp: reqwest::Response,
    request_id: RequestId,
    domain: Domain,
    account_id: AccountId,
) -> Response {
    let status = resp.status().as_u16();
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            let err = ProxyError::Network(e.to_string());
            persist_failed_response(&state, &request_id, domain, account_id, err.status_code(), &err).await;
            return error_response(&err, &request_id);
        }
    };

    let parsed: Option<ChatResponse> = serde_json::from_slice(&bytes).ok();
    let body_value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    let response_record = ResponseRecord {
        request_id: request_id.clone(),
        domain: domain.clone(),
        account_id,
        status,
        body: body_value,
        input_tokens: parsed.as_ref().map(|r| r.usage.input_tokens).unwrap_or(0),
        output_tokens: parsed.as_ref().map(|r| r.usage.output_tokens).unwrap_or(0),
        cache_creation_input_tokens: parsed.as_ref().map(|r| r.usage.cache_creation_input_tokens).unwrap_or(0),
        cache_read_input_tokens: parsed.as_ref().map(|r| r.usage.cache_read_input_tokens).unwrap_or(0),
        timestamp: Utc::now(),
    };
    state.writer.enqueue_response(response_record, domain).await;

    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

async fn handle_streaming(
    state: Arc<AppState>,
    resp: reqwest::Response,
    request_id: RequestId,
    domain: Domain,
    account_id: AccountId,
) -> Response {
    let (client_tx, client_rx) = mpsc::channel::<Bytes>(64);
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<nexus_upstream::ChunkRecord>(256);

    let chunk_request_id = request_id.clone();
    let chunk_writer = state.writer.clone();
    tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            chunk_writer
                .enqueue_chunk(StreamingChunkRecord {
                    request_id: chunk_request_id.clone(),
                    chunk_index: chunk.chunk_index,
                    timestamp: Utc::now(),
                    raw_event_text: chunk.raw_event_text,
                    token_delta: chunk.token_delta,
                })
                .await;
        }
    });

    let assemble_request_id = request_id.clone();
    let assemble_state = state.clone();
    tokio::spawn(async move {
        let assembled = nexus_upstream::assemble(resp, client_tx, chunk_tx).await;
        if let Some(failure) = &assembled.failed {
            warn!(request_id = %assemble_request_id, error = %failure, "stream carried an error event");
        }
        if assembled.client_disconnected {
            info!(request_id = %assemble_request_id, "client disconnected mid-stream");
        }

        // Partial/failed streams still get a ResponseRecord, just not a 200
        // (spec §4.9 step 9 / ClientDisconnect semantics).
        let status = if assembled.client_disconnected {
            ProxyError::ClientDisconnect.status_code()
        } else if assembled.failed.is_some() {
            502
        } else {
            200
        };

        let body_value = serde_json::to_value(&assembled.response).unwrap_or(Value::Null);
        let response_record = ResponseRecord {
            request_id: assemble_request_id.clone(),
            domain: domain.clone(),
            account_id,
            status,
            body: body_value,
            input_tokens: assembled.response.usage.input_tokens,
            output_tokens: assembled.response.usage.output_tokens,
            cache_creation_input_tokens: assembled.response.usage.cache_creation_input_tokens,
            cache_read_input_tokens: assembled.response.usage.cache_read_input_tokens,
            timestamp: Utc::now(),
        };
        assemble_state.writer.enqueue_response(response_record, domain).await;
    });

    let stream = ReceiverStream::new(client_rx).map(Ok::<Bytes, std::io::Error>);
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    response
}

fn resolve_domain(headers: &HeaderMap) -> Domain {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(Domain::from)
        .unwrap_or_else(|| Domain::from("default"))
}

fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

fn error_response(err: &ProxyError, request_id: &RequestId) -> Response {
    error!(request_id = %request_id, error = %err, code = err.code(), "request failed");
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error_envelope(err, request_id.as_str())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn resolve_domain_falls_back_when_host_missing() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_domain(&headers).as_str(), "default");
    }

    #[test]
    fn resolve_domain_reads_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("acme.example.com"));
        assert_eq!(resolve_domain(&headers).as_str(), "acme.example.com");
    }

    #[test]
    fn content_type_accepts_json_with_charset_suffix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(content_type_is_json(&headers));
    }

    #[test]
    fn content_type_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(!content_type_is_json(&headers));
    }
}
