use hostmon::uplink::Client;
use reqwest::Method;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> Client {
    Client::new(server.uri(), "agent-uuid", "agent-password", false).unwrap()
}

async fn mount_jwt(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/jwt-auth/"))
        .and(body_partial_json(json!({"username": "agent-uuid"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": token})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn requests_carry_the_jwt_and_decode_json() {
    let server = MockServer::start().await;
    mount_jwt(&server, "tok-1").await;

    Mock::given(method("GET"))
        .and(path("/v1/agent/"))
        .and(header("Authorization", "Bearer tok-1"))
        .and(header("X-Requested-With", "XMLHttpRequest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "a1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let (status, body): (_, serde_json::Value) = client
        .request::<(), _>(Method::GET, "v1/agent/", None)
        .await
        .unwrap();

    assert_eq!(status.as_u16(), 200);
    assert_eq!(body["id"], "a1");
}

#[tokio::test]
async fn a_401_clears_the_token_and_retries_once() {
    let server = MockServer::start().await;

    // First token is rejected once; the refreshed token succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/jwt-auth/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-1"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/jwt-auth/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-2"})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/metric/"))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/metric/"))
        .and(header("Authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let (status, _): (_, serde_json::Value) = client
        .request::<(), _>(Method::GET, "v1/metric/", None)
        .await
        .unwrap();

    assert_eq!(status.as_u16(), 200);
}

#[tokio::test]
async fn a_401_on_the_retry_surfaces_as_an_auth_error() {
    let server = MockServer::start().await;
    mount_jwt(&server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/v1/metric/"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .request::<(), serde_json::Value>(Method::GET, "v1/metric/", None)
        .await
        .unwrap_err();

    assert!(err.is_auth_error());
    assert_eq!(err.status_code(), 401);
}

#[tokio::test]
async fn a_4xx_from_the_jwt_endpoint_is_an_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/jwt-auth/"))
        .respond_with(ResponseTemplate::new(403).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .request::<(), serde_json::Value>(Method::GET, "v1/metric/", None)
        .await
        .unwrap_err();

    assert!(err.is_auth_error());
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn iteration_follows_next_links_and_accumulates_results() {
    let server = MockServer::start().await;
    mount_jwt(&server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/v1/metric/"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next": null,
            "results": [{"id": 2}, {"id": 3}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page2 = format!("{}/v1/metric/?page=2", server.uri());
    Mock::given(method("GET"))
        .and(path("/v1/metric/"))
        .and(query_param("page_size", "100"))
        .and(query_param("active", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next": page2,
            "results": [{"id": 1}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let results = client
        .iterate("metric", &[("active", "true")])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["id"], 1);
    assert_eq!(results[2]["id"], 3);
}

#[tokio::test]
async fn a_404_terminates_iteration_cleanly() {
    let server = MockServer::start().await;
    mount_jwt(&server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/v1/gone/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    let results = client.iterate("gone", &[]).await.unwrap();

    assert!(results.is_empty());
}

#[tokio::test]
async fn not_found_predicate() {
    let server = MockServer::start().await;
    mount_jwt(&server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/v1/agent/ghost/"))
        .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .request::<(), serde_json::Value>(Method::GET, "v1/agent/ghost/", None)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_auth_error());
}

#[tokio::test]
async fn registration_uses_basic_auth_and_returns_the_identity() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/agent/"))
        .and(body_partial_json(json!({"account": "acc-1"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "agent-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let agent = client
        .register("acc-1", "reg-key", "host-1", "initial-pass")
        .await
        .unwrap();

    assert_eq!(agent.id, "agent-42");
}

#[tokio::test]
async fn undecodable_bodies_set_the_unmarshal_error() {
    let server = MockServer::start().await;
    mount_jwt(&server, "tok").await;

    Mock::given(method("GET"))
        .and(path("/v1/metric/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .request::<(), serde_json::Value>(Method::GET, "v1/metric/", None)
        .await
        .unwrap_err();

    assert!(err.unmarshal_error().is_some());
    assert_eq!(err.status_code(), 200);
}
