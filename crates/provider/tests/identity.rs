use serde_json::json;
use warden_core::{ErrorKind, Secret, TrustKind};
use warden_provider::{IdentityProvider, RetryPolicy, TokenInfoIdentity};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn identity(server: &MockServer) -> TokenInfoIdentity {
    TokenInfoIdentity::new(Secret::new("ya29.token"), TrustKind::InteractiveUser, RetryPolicy::none())
        .unwrap()
        .with_url(format!("{}/tokeninfo", server.uri()))
}

#[tokio::test]
async fn resolves_email_from_token_info() {
    let server = MockServer::start().await;
    let email = concat!("alice", "@example.com");
    Mock::given(method("POST"))
        .and(path("/tokeninfo"))
        .and(body_string_contains("access_token=ya29.token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "email": email,
            "email_verified": "true",
            "expires_in": "3599"
        })))
        .mount(&server)
        .await;

    let id = identity(&server);
    assert_eq!(id.current_principal_email().await.unwrap(), email);
    assert_eq!(id.trust_kind(), TrustKind::InteractiveUser);
}

#[tokio::test]
async fn expired_token_asks_for_reauthentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokeninfo"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_token",
            "error_description": "Invalid Value"
        })))
        .mount(&server)
        .await;

    let err = identity(&server).current_principal_email().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Reauthenticate);
}

#[tokio::test]
async fn token_without_email_scope_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokeninfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "expires_in": "3599" })))
        .mount(&server)
        .await;

    let err = identity(&server).current_principal_email().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Other);
}

#[tokio::test]
async fn token_stays_out_of_the_request_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tokeninfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "email": "x" })))
        .mount(&server)
        .await;

    identity(&server).current_principal_email().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].url.as_str().contains("ya29.token"));
}

#[tokio::test]
async fn transport_errors_do_not_echo_the_token() {
    // Nothing listens on port 1.
    let id = TokenInfoIdentity::new(Secret::new("ya29.secret"), TrustKind::InteractiveUser, RetryPolicy::none())
        .unwrap()
        .with_url("http://127.0.0.1:1/tokeninfo");

    let err = id.current_principal_email().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unavailable);
    assert!(!err.message.contains("ya29.secret"), "{}", err.message);
    assert!(!err.to_string().contains("ya29.secret"));
}
