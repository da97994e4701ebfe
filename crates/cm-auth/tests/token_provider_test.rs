//! Client-credentials exchange against a mock token endpoint.

use std::time::Duration;

use cm_auth::{AuthError, ClientCredentialsTokenProvider, TokenProvider};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_PATH: &str = "/multipass/api/oauth2/token";

fn token_body(token: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": token,
        "scope": "compass:read",
        "expires_in": 3600,
        "token_type": "bearer",
    })
}

fn provider(server: &MockServer, interval: Duration) -> ClientCredentialsTokenProvider {
    ClientCredentialsTokenProvider::builder()
        .hostname(server.uri())
        .client_id("client_id")
        .client_secret("client_secret")
        .scopes(["compass:read", "compass:edit"])
        .refresh_interval(interval)
        .build()
        .expect("provider should build")
}

#[tokio::test]
async fn fetches_token_with_form_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=client_id"))
        .and(body_string_contains("client_secret=client_secret"))
        .and(body_string_contains("scope=compass%3Aread+compass%3Aedit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("token-1")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_secs(3600));
    assert_eq!(provider.get().await.unwrap(), "token-1");
}

#[tokio::test]
async fn calls_inside_window_exchange_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("token-1")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_secs(3600));
    for _ in 0..5 {
        assert_eq!(provider.token().await.unwrap(), "token-1");
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("token-1"))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_secs(3600));
    let (a, b, c) = tokio::join!(provider.get(), provider.get(), provider.get());
    assert_eq!(a.unwrap(), "token-1");
    assert_eq!(b.unwrap(), "token-1");
    assert_eq!(c.unwrap(), "token-1");
}

#[tokio::test]
async fn refreshes_after_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("token-1")))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("token-2")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_millis(50));
    assert_eq!(provider.get().await.unwrap(), "token-1");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(provider.get().await.unwrap(), "token-2");
    assert_eq!(provider.get().await.unwrap(), "token-2");
}

#[tokio::test]
async fn failure_without_token_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad client"))
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_secs(3600));
    let err = provider.get().await.unwrap_err();
    assert!(matches!(err, AuthError::NoToken(_)));
}

#[tokio::test]
async fn failed_refresh_keeps_stale_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("token-1")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_millis(30));
    assert_eq!(provider.get().await.unwrap(), "token-1");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(provider.get().await.unwrap(), "token-1");
}

#[tokio::test]
async fn malformed_body_is_a_soft_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider(&server, Duration::from_secs(3600));
    assert!(provider.get().await.is_err());
}
