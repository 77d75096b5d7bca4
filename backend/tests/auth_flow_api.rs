use axum::{
    body::Body,
    http::{header, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

mod support;

use support::{
    body_json, cookie_was_cleared, json_request, login_request, refresh_cookie, refresh_request,
    request, request_from_agent, test_app, test_config, StaticCredentials,
};

const EMAIL: &str = "alice@example.com";
const PASSWORD: &str = "correct horse battery";

struct Session {
    access_token: String,
    refresh_token: String,
}

fn app() -> Router {
    let credentials = StaticCredentials::with_account(EMAIL, PASSWORD, &["user"]);
    test_app(test_config(), credentials).0
}

async fn login(app: &Router, email: &str, password: &str) -> Session {
    let response = app
        .clone()
        .oneshot(login_request(email, password))
        .await
        .expect("call login");
    assert_eq!(response.status(), StatusCode::OK);
    let refresh_token = refresh_cookie(&response).expect("refresh cookie set");
    let body = body_json(response).await;
    Session {
        access_token: body["access_token"].as_str().expect("access token").to_string(),
        refresh_token,
    }
}

async fn refresh(app: &Router, refresh_token: &str) -> (StatusCode, Option<String>, bool, Value) {
    let response = app
        .clone()
        .oneshot(refresh_request(refresh_token))
        .await
        .expect("call refresh");
    let status = response.status();
    let cookie = refresh_cookie(&response);
    let cleared = cookie_was_cleared(&response);
    (status, cookie, cleared, body_json(response).await)
}

fn authed(method: &str, uri: &str, access_token: &str, refresh_token: Option<&str>) -> axum::http::Request<Body> {
    let mut builder = request(method, uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", access_token));
    if let Some(refresh_token) = refresh_token {
        builder = builder.header(header::COOKIE, format!("refresh_token={}", refresh_token));
    }
    builder.body(Body::empty()).expect("build authed request")
}

#[tokio::test]
async fn login_returns_access_token_and_sets_refresh_cookie() {
    let app = app();
    let response = app
        .clone()
        .oneshot(login_request("  Alice@Example.com ", PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let cookie = support::set_cookies(&response)
        .into_iter()
        .find(|cookie| cookie.starts_with("refresh_token="))
        .expect("refresh cookie");
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Path=/api/auth"));

    let body = body_json(response).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["subject"], EMAIL);
    assert_eq!(body["roles"], json!(["user"]));
    assert_eq!(body["expires_in"], 15 * 60);
    assert!(body.get("refresh_token").is_none());
}

#[tokio::test]
async fn refresh_rotates_and_replay_of_old_cookie_ends_the_family() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    let (status, rotated, _, body) = refresh(&app, &session.refresh_token).await;
    assert_eq!(status, StatusCode::OK);
    let rotated = rotated.expect("rotated cookie");
    assert_ne!(rotated, session.refresh_token);
    assert_eq!(body["subject"], EMAIL);
    assert_eq!(body["roles"], json!(["user"]));

    let (status, _, cleared, body) = refresh(&app, &session.refresh_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "REFRESH_REPLAY_DETECTED");
    assert!(cleared);

    // The legitimate holder is logged out too.
    let (status, _, cleared, body) = refresh(&app, &rotated).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNKNOWN_REFRESH");
    assert!(cleared);
}

#[tokio::test]
async fn refresh_without_cookie_is_rejected_without_clearing() {
    let app = app();
    let response = app
        .clone()
        .oneshot(request("POST", "/api/auth/refresh").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!cookie_was_cleared(&response));
    assert_eq!(body_json(response).await["code"], "MISSING_REFRESH_TOKEN");
}

#[tokio::test]
async fn malformed_cookie_is_reported_and_cleared() {
    let app = app();
    let (status, _, cleared, body) = refresh(&app, "not-a-jwt").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "MALFORMED");
    assert!(cleared);
}

#[tokio::test]
async fn access_token_in_refresh_cookie_is_wrong_type() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;
    let (status, _, cleared, body) = refresh(&app, &session.access_token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_TOKEN_TYPE");
    assert!(!cleared);
}

#[tokio::test]
async fn bearer_of_another_subject_fails_binding_and_leaves_family_usable() {
    let credentials = StaticCredentials::with_account(EMAIL, PASSWORD, &["user"]);
    credentials.add("bob@example.com", "bob password", &["user"]);
    let (app, _) = test_app(test_config(), credentials);
    let alice = login(&app, EMAIL, PASSWORD).await;
    let bob = login(&app, "bob@example.com", "bob password").await;

    let response = app
        .clone()
        .oneshot(authed(
            "POST",
            "/api/auth/refresh",
            &bob.access_token,
            Some(&alice.refresh_token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "REFRESH_BINDING_MISMATCH");

    let (status, _, _, _) = refresh(&app, &alice.refresh_token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn refresh_from_another_device_is_refused_without_rotating() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    let response = app
        .clone()
        .oneshot(
            request_from_agent("POST", "/api/auth/refresh", "stolen-cookie-agent/2.0")
                .header(header::COOKIE, format!("refresh_token={}", session.refresh_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!cookie_was_cleared(&response));
    assert_eq!(body_json(response).await["code"], "REFRESH_DEVICE_MISMATCH");

    let (status, _, _, _) = refresh(&app, &session.refresh_token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn refresh_from_another_ip_is_refused() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    let response = app
        .clone()
        .oneshot(
            request("POST", "/api/auth/refresh")
                .header("x-forwarded-for", "198.51.100.77")
                .header(header::COOKIE, format!("refresh_token={}", session.refresh_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "REFRESH_IP_MISMATCH");
}

#[tokio::test]
async fn lockout_is_indistinguishable_from_wrong_password() {
    let app = app();

    let mut wrong_password_body = Value::Null;
    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(login_request(EMAIL, "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        wrong_password_body = body_json(response).await;
    }
    assert_eq!(wrong_password_body["code"], "INVALID_CREDENTIALS");

    let response = app
        .clone()
        .oneshot(login_request(EMAIL, PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(refresh_cookie(&response).is_none());
    assert_eq!(body_json(response).await, wrong_password_body);
}

#[tokio::test]
async fn logout_clears_cookie_and_revokes_family() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    let response = app
        .clone()
        .oneshot(
            request("POST", "/api/auth/logout")
                .header(header::COOKIE, format!("refresh_token={}", session.refresh_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cookie_was_cleared(&response));

    let (status, _, _, body) = refresh(&app, &session.refresh_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNKNOWN_REFRESH");
}

#[tokio::test]
async fn logout_without_cookie_still_succeeds() {
    let app = app();
    let response = app
        .clone()
        .oneshot(request("POST", "/api/auth/logout").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cookie_was_cleared(&response));
}

#[tokio::test]
async fn protected_routes_require_an_access_token() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    let response = app
        .clone()
        .oneshot(request("GET", "/api/auth/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(authed("GET", "/api/auth/sessions", &session.refresh_token, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_TOKEN_TYPE");

    let response = app
        .clone()
        .oneshot(authed("GET", "/api/auth/sessions", "garbage", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "MALFORMED");
}

#[tokio::test]
async fn sessions_can_be_listed_and_revoked_individually() {
    let app = app();
    let laptop = login(&app, EMAIL, PASSWORD).await;
    let phone = login(&app, EMAIL, PASSWORD).await;

    let response = app
        .clone()
        .oneshot(authed(
            "GET",
            "/api/auth/sessions",
            &laptop.access_token,
            Some(&laptop.refresh_token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sessions = body_json(response).await;
    let sessions = sessions.as_array().expect("session list");
    assert_eq!(sessions.len(), 2);
    let current: Vec<&Value> = sessions.iter().filter(|s| s["is_current"] == true).collect();
    assert_eq!(current.len(), 1);
    let other_id = sessions
        .iter()
        .find(|s| s["is_current"] == false)
        .and_then(|s| s["family_id"].as_str())
        .expect("other session id")
        .to_string();

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/auth/sessions/{}", other_id),
            &laptop.access_token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, _, _, body) = refresh(&app, &phone.refresh_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNKNOWN_REFRESH");

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/auth/sessions/{}", uuid::Uuid::new_v4()),
            &laptop.access_token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sessions_of_other_subjects_are_not_found() {
    let credentials = StaticCredentials::with_account(EMAIL, PASSWORD, &["user"]);
    credentials.add("mallory@example.com", "mallory password", &[]);
    let (app, state) = test_app(test_config(), credentials);
    let alice = login(&app, EMAIL, PASSWORD).await;
    let mallory = login(&app, "mallory@example.com", "mallory password").await;

    let alice_family = state
        .sessions
        .engine()
        .family_id_from_token(&alice.refresh_token)
        .expect("family id");

    let response = app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/api/auth/sessions/{}", alice_family),
            &mallory.access_token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let (status, _, _, _) = refresh(&app, &alice.refresh_token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn logout_all_revokes_every_family_of_the_subject() {
    let app = app();
    let first = login(&app, EMAIL, PASSWORD).await;
    let second = login(&app, EMAIL, PASSWORD).await;

    let response = app
        .clone()
        .oneshot(authed("POST", "/api/auth/logout-all", &first.access_token, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cookie_was_cleared(&response));
    assert_eq!(body_json(response).await["revoked_sessions"], 2);

    for token in [&first.refresh_token, &second.refresh_token] {
        let (status, _, _, body) = refresh(&app, token).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNKNOWN_REFRESH");
    }
}

#[tokio::test]
async fn change_password_revokes_sessions_and_accepts_new_password() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    let wrong_current = request("PUT", "/api/auth/change-password")
        .header(header::AUTHORIZATION, format!("Bearer {}", session.access_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "current_password": "nope", "new_password": "brand new secret" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(wrong_current).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let change = request("PUT", "/api/auth/change-password")
        .header(header::AUTHORIZATION, format!("Bearer {}", session.access_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "current_password": PASSWORD, "new_password": "brand new secret" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(change).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(cookie_was_cleared(&response));

    let (status, _, _, _) = refresh(&app, &session.refresh_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(login_request(EMAIL, PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    login(&app, EMAIL, "brand new secret").await;
}

fn change_password_request(access_token: &str, current: &str) -> axum::http::Request<Body> {
    request("PUT", "/api/auth/change-password")
        .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "current_password": current, "new_password": "brand new secret" }).to_string(),
        ))
        .expect("build change-password request")
}

#[tokio::test]
async fn change_password_guesses_count_towards_lockout() {
    let app = app();
    let session = login(&app, EMAIL, PASSWORD).await;

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(change_password_request(&session.access_token, "guess"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let response = app
        .clone()
        .oneshot(change_password_request(&session.access_token, PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!cookie_was_cleared(&response));

    let response = app
        .clone()
        .oneshot(login_request(EMAIL, PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "INVALID_CREDENTIALS");

    let (status, _, _, _) = refresh(&app, &session.refresh_token).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn login_payload_is_validated() {
    let app = app();
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            json!({ "email": "", "password": "" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn public_routes_are_rate_limited_per_ip() {
    let mut config = test_config();
    config.rate_limit_ip_max_requests = 2;
    config.rate_limit_ip_window_seconds = 3600;
    let credentials = StaticCredentials::with_account(EMAIL, PASSWORD, &[]);
    let (app, _) = test_app(config, credentials);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(login_request(EMAIL, "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = app
        .clone()
        .oneshot(login_request(EMAIL, PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["code"], "RATE_LIMIT_EXCEEDED");
}
