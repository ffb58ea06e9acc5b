//! End-to-end tests: real upstream, JWKS endpoint and gateway over TCP

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::{Client, StatusCode, header};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{
    FOREIGN_KEY, SIGNING_KEY, bearer, gateway_config, spawn_gateway, spawn_jwks, spawn_upstream,
};

async fn body_json(response: reqwest::Response) -> Value {
    response.json().await.unwrap()
}

#[tokio::test]
async fn missing_token_is_rejected_before_upstream() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;

    let response = Client::new()
        .get(format!("{base}/api/traction/tenant"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );
    assert_eq!(body_json(response).await, json!({ "message": "Unauthorized" }));
    assert_eq!(hits.get(), 0);
}

#[tokio::test]
async fn token_signed_by_unknown_key_is_invalid() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;

    let response = Client::new()
        .get(format!("{base}/api/traction/tenant"))
        .header(header::AUTHORIZATION, bearer(FOREIGN_KEY))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Invalid token");
    assert!(body["error"].is_string());
    assert_eq!(hits.get(), 0);
}

#[tokio::test]
async fn valid_token_is_forwarded_with_prefix_stripped() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;
    let auth = bearer(SIGNING_KEY);

    let response = Client::new()
        .get(format!("{base}/api/traction/foo?page=2"))
        .header(header::AUTHORIZATION, &auth)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let echo = body_json(response).await;
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["path"], "/foo");
    assert_eq!(echo["query"], "page=2");
    assert_eq!(echo["host"], upstream.to_string());
    assert_eq!(echo["authorization"], auth);
    assert!(echo["forwarded_host"].as_str().unwrap().starts_with("127.0.0.1"));
    assert_eq!(hits.get(), 1);
}

#[tokio::test]
async fn jwks_is_fetched_once_for_many_requests() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, jwks_hits) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;
    let client = Client::new();

    for _ in 0..5 {
        let response = client
            .get(format!("{base}/api/traction/foo"))
            .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(jwks_hits.get(), 1);
}

#[tokio::test]
async fn json_body_is_reconstructed() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;

    let response = Client::new()
        .post(format!("{base}/api/traction/tenant/config"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body("{ \"a\" : 1,\n  \"b\" : [ true ] }")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let echo = body_json(response).await;
    assert_eq!(echo["path"], "/tenant/config");
    assert_eq!(echo["body"], r#"{"a":1,"b":[true]}"#);
}

#[tokio::test]
async fn tenant_token_body_passes_through_untouched() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;
    let raw = "{ \"api_key\" : \"k-123\",  \"wallet_id\":\"w\" }";

    let response = Client::new()
        .post(format!("{base}/api/traction/tenant/token"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(raw)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let echo = body_json(response).await;
    assert_eq!(echo["path"], "/tenant/token");
    assert_eq!(echo["body"], raw);
}

#[tokio::test]
async fn malformed_json_body_is_bad_request() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;

    let response = Client::new()
        .post(format!("{base}/api/traction/tenant/config"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "Invalid JSON body");
    assert_eq!(hits.get(), 0);
}

#[tokio::test]
async fn upstream_redirects_are_followed() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;

    let response = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
        .get(format!("{base}/api/traction/old"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["path"], "/new");
}

#[tokio::test]
async fn upstream_errors_are_relayed_verbatim() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;

    let response = Client::new()
        .get(format!("{base}/api/traction/teapot"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "kettle");
    assert_eq!(response.text().await.unwrap(), "short and stout");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let (jwks, _) = spawn_jwks().await;
    // Bind then drop to get a port nothing listens on
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let base = spawn_gateway(gateway_config(closed, jwks)).await;

    let response = Client::new()
        .get(format!("{base}/api/traction/foo"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["message"], "Bad Gateway");
}

#[tokio::test]
async fn public_endpoints_need_no_token() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, jwks_hits) = spawn_jwks().await;
    let base = spawn_gateway(gateway_config(upstream, jwks)).await;
    let client = Client::new();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["status"], "ok");

    let config = client.get(format!("{base}/config")).send().await.unwrap();
    assert_eq!(config.status(), StatusCode::OK);
    assert_eq!(
        body_json(config).await,
        json!({ "tenantProxyPath": "/api/traction" })
    );

    assert_eq!(jwks_hits.get(), 0);
}

#[tokio::test]
async fn unauthenticated_route_is_forwarded_without_token() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let mut config = gateway_config(upstream, jwks);
    config.proxy.routes[0].require_auth = false;
    let base = spawn_gateway(config).await;

    let response = Client::new()
        .get(format!("{base}/api/traction/server/status"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["path"], "/server/status");
    assert_eq!(hits.get(), 1);
}

#[tokio::test]
async fn slow_upstream_is_gateway_timeout() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let mut config = gateway_config(upstream, jwks);
    config.proxy.routes[0].timeout = Duration::from_millis(200);
    let base = spawn_gateway(config).await;

    let response = Client::new()
        .get(format!("{base}/api/traction/slow"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .timeout(common::SLOW_RESPONSE)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["message"], "Gateway Timeout");
    assert_eq!(hits.get(), 1);
}

#[tokio::test]
async fn oversized_body_is_rejected_before_upstream() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let mut config = gateway_config(upstream, jwks);
    config.server.max_body_size = 16;
    let base = spawn_gateway(config).await;

    let response = Client::new()
        .post(format!("{base}/api/traction/tenant/config"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"wallet_name":"a name well over sixteen bytes"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(response).await["message"], "Payload Too Large");
    assert_eq!(hits.get(), 0);
}

#[tokio::test]
async fn redirects_are_relayed_when_following_is_off() {
    let (upstream, _) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let mut config = gateway_config(upstream, jwks);
    config.proxy.routes[0].max_redirects = 0;
    let base = spawn_gateway(config).await;

    let response = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
        .get(format!("{base}/api/traction/old"))
        .header(header::AUTHORIZATION, bearer(SIGNING_KEY))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/new");
}

#[tokio::test]
async fn dot_segments_cannot_escape_a_public_route() {
    let (upstream, hits) = spawn_upstream().await;
    let (jwks, _) = spawn_jwks().await;
    let mut config = gateway_config(upstream, jwks);
    let mut public = config.proxy.routes[0].clone();
    public.prefix = "/api/public".to_string();
    public.target = format!("http://{upstream}/public/");
    public.require_auth = false;
    config.proxy.routes.push(public);
    let base = spawn_gateway(config).await;
    let addr = base.trim_start_matches("http://");

    // Raw request: an HTTP client would normalize the path before sending
    for path in ["/api/public/../tenant/secret", "/api/public/%2e%2e/tenant/secret"] {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 400"), "{path}: {raw}");
        assert!(raw.contains(r#""message":"Bad Request""#), "{path}: {raw}");
    }
    assert_eq!(hits.get(), 0);
}
