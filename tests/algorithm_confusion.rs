mod helpers;

use axum::http::StatusCode;
use delegation_auth::signer;

#[tokio::test]
async fn forged_none_algorithm_token_introspects_inactive_and_is_forbidden() {
    let state = helpers::test_auth_state();
    let app = helpers::auth_test_router(state.clone());

    let (_, agent) =
        helpers::post_json(&app, "/register", serde_json::json!({ "name": "bot", "scopes": ["read:data"] })).await;
    let agent_id = agent["id"].as_str().unwrap().to_owned();
    helpers::post_json(&app, "/register_user", serde_json::json!({ "username": "alice", "secret": "password123" })).await;

    let (_, body) = helpers::get_json(&app, &format!("/authorize?client_id={agent_id}&user=alice")).await;
    let delegation_token = body["delegation_token"].as_str().unwrap();
    let (_, body) = helpers::post_json(&app, "/token", serde_json::json!({ "delegation_token": delegation_token })).await;
    let real_access_token = body["access_token"].as_str().unwrap();

    // Forge a token with the same claims as a real access token, but
    // signed (unsigned, really) under "none" rather than HS256.
    let forged = signer::forge_with_alg(
        "none",
        &serde_json::json!({
            "iss": "http://localhost:8080",
            "sub": "alice",
            "actor": agent_id,
            "scope": ["read:data"],
            "exp": (chrono::Utc::now() + chrono::Duration::minutes(5)).timestamp(),
            "iat": chrono::Utc::now().timestamp(),
            "jti": "forged-jti",
            "delegation_id": "whatever",
        }),
    );

    let (status, body) = helpers::post_json(&app, "/introspect", serde_json::json!({ "token": forged })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);

    // A real token still introspects active, confirming the rejection is
    // specific to the forged algorithm and not a blanket failure.
    let (_, body) =
        helpers::post_json(&app, "/introspect", serde_json::json!({ "token": real_access_token })).await;
    assert_eq!(body["active"], true);
}
