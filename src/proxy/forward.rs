//! Request forwarding to the upstream of a matched route

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Request, header},
    response::Response,
};
use futures::TryStreamExt;
use tracing::{debug, warn};

use super::{BodyPolicy, ProxyError, ProxyRoute};

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward `request` to the upstream of `route` and relay the response.
///
/// The request body is buffered (bounded by `max_body_size`) so the body
/// policy can be applied and so 307/308 redirects can replay it. The
/// response body streams back unbuffered.
pub async fn forward(
    route: &ProxyRoute,
    request: Request<Body>,
    max_body_size: usize,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();

    if declared_length(&parts.headers).is_some_and(|len| len > max_body_size) {
        return Err(ProxyError::BodyTooLarge(max_body_size));
    }

    let url = route
        .upstream_url(path, parts.uri.query())
        .ok_or_else(|| ProxyError::InvalidPath(path.to_string()))?;
    let policy = route.body_policy(path);

    let bytes = axum::body::to_bytes(body, max_body_size)
        .await
        .map_err(|_| ProxyError::BodyTooLarge(max_body_size))?;
    let body = apply_body_policy(policy, &parts.headers, bytes)?;

    let mut headers = forwardable_headers(&parts.headers);
    add_forwarded_headers(&parts.headers, &mut headers);

    debug!(
        method = %parts.method,
        path = %path,
        upstream = %url,
        policy = ?policy,
        "Forwarding request"
    );

    // Dropping this future (client disconnect) aborts the upstream call
    let upstream = route
        .client
        .request(parts.method, url)
        .headers(headers)
        .timeout(route.timeout)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout(route.timeout)
            } else {
                ProxyError::Upstream(e)
            }
        })?;

    let status = upstream.status();
    let mut response_headers = forwardable_headers(upstream.headers());
    if let Some(len) = upstream.headers().get(header::CONTENT_LENGTH) {
        response_headers.insert(header::CONTENT_LENGTH, len.clone());
    }
    debug!(status = %status, final_url = %upstream.url(), "Upstream responded");

    let stream = upstream
        .bytes_stream()
        .inspect_err(|e| warn!(error = %e, "Upstream body stream failed"));

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Apply the route's body policy to a buffered body
pub fn apply_body_policy(
    policy: BodyPolicy,
    headers: &HeaderMap,
    bytes: Bytes,
) -> Result<Bytes, ProxyError> {
    match policy {
        BodyPolicy::Reconstruct if !bytes.is_empty() && is_json(headers) => {
            let value: serde_json::Value =
                serde_json::from_slice(&bytes).map_err(ProxyError::InvalidJsonBody)?;
            let rebuilt = serde_json::to_vec(&value).map_err(ProxyError::InvalidJsonBody)?;
            Ok(Bytes::from(rebuilt))
        }
        _ => Ok(bytes),
    }
}

/// `application/json` or any `+json` media type
#[must_use]
pub fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().to_ascii_lowercase())
        .is_some_and(|mime| mime == "application/json" || mime.ends_with("+json"))
}

/// Copy headers minus hop-by-hop ones, `host` and `content-length`.
///
/// Headers listed in `Connection` are hop-by-hop too.
#[must_use]
pub fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = source
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || connection_listed.iter().any(|c| c == lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn add_forwarded_headers(inbound: &HeaderMap, outbound: &mut HeaderMap) {
    if let Some(host) = inbound.get(header::HOST) {
        outbound.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }
    if !outbound.contains_key("x-forwarded-proto") {
        outbound.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static("http"),
        );
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
