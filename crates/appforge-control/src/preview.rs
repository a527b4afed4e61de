use std::collections::HashMap;

use appforge_agent::ProjectError;
use appforge_process::ProjectId;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};

use crate::api_error::ApiError;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Path and query to request upstream, taken from the raw URI so encoding and
/// trailing slashes survive.
fn upstream_path(uri: &Uri, id: &str) -> String {
    let prefix = format!("/preview/{id}");
    let rest = uri.path().strip_prefix(prefix.as_str()).unwrap_or("");
    let mut out = if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    };
    if let Some(q) = uri.query() {
        out.push('?');
        out.push_str(q);
    }
    out
}

/// End-to-end headers only. Used in both directions: towards the project's
/// server and back to the client.
fn forwarded_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut out = incoming.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out
}

pub async fn forward(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Response {
    let Some(id) = params.get("id") else {
        return ApiError::invalid_param("missing project id").into_response();
    };
    match proxy(&state, ProjectId::from(id.as_str()), req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn proxy(state: &AppState, id: ProjectId, req: Request) -> Result<Response, ApiError> {
    let record = state.manager.resolve_running(&id).await?;

    let (parts, body) = req.into_parts();
    let path = upstream_path(&parts.uri, id.as_str());
    let url = format!(
        "http://{}:{}{path}",
        state.manager.config().upstream_host,
        record.port
    );

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "invalid_param",
            format!("request body rejected: {e}"),
        )
    })?;

    let upstream = state
        .http
        .request(parts.method.clone(), url.as_str())
        .headers(forwarded_headers(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(project_id = %id, port = record.port, error = %e, "preview upstream unavailable");
            ApiError::from(ProjectError::Upstream(format!("{url}: {e}")))
        })?;

    tracing::debug!(project_id = %id, method = %parts.method, path = %path, status = %upstream.status(), "preview forwarded");

    let status = upstream.status();
    let headers = forwarded_headers(upstream.headers());
    let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    Ok(resp)
}
