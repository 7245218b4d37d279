mod helpers;

use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::Pkcs1v15Sign;
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Hand-construct an RS256 DPoP proof the way a real agent SDK would:
/// header carries the caller's own public key as a JWK, payload binds
/// the proof to the exact method/URL and carries replay-suppression
/// fields. `jwt-simple`'s own signer has no way to inject a `jwk` header
/// field, so this mirrors its wire format directly with the `rsa` crate.
fn build_dpop_proof(method: &str, url: &str, jti: &str) -> String {
    let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("rsa keygen");
    let public_key = RsaPublicKey::from(&private_key);

    let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

    let header = serde_json::json!({ "alg": "RS256", "jwk": { "n": n, "e": e } });
    let now = chrono::Utc::now().timestamp();
    let payload = serde_json::json!({
        "iat": now,
        "exp": now + 300,
        "jti": jti,
        "htm": method,
        "htu": url,
    });

    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
    let signing_input = format!("{header_b64}.{payload_b64}");
    let digest = Sha256::digest(signing_input.as_bytes());
    let signature = private_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).expect("rsa sign");
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

    format!("{signing_input}.{signature_b64}")
}

async fn spawn_auth_server(state: delegation_auth::http::AuthState) -> String {
    let app = delegation_auth::http::auth_router()
        .with_state(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn dpop_bound_request_reaches_the_resource() {
    let state = helpers::test_auth_state();

    let (_, agent) = {
        let app = helpers::auth_test_router(state.clone());
        helpers::post_json(&app, "/register", serde_json::json!({ "name": "bot", "scopes": ["read:data"] })).await
    };
    let agent_id = agent["id"].as_str().unwrap().to_owned();
    {
        let app = helpers::auth_test_router(state.clone());
        helpers::post_json(&app, "/register_user", serde_json::json!({ "username": "alice", "secret": "password123" }))
            .await;
    }

    let base_url = spawn_auth_server(state.clone()).await;

    let access_token = {
        let app = helpers::auth_test_router(state.clone());
        let (_, body) = helpers::get_json(&app, &format!("/authorize?client_id={agent_id}&user=alice")).await;
        let delegation_token = body["delegation_token"].as_str().unwrap().to_owned();
        let (_, body) =
            helpers::post_json(&app, "/token", serde_json::json!({ "delegation_token": delegation_token })).await;
        body["access_token"].as_str().unwrap().to_owned()
    };

    let resource_app = helpers::resource_test_router(format!("{base_url}/introspect"), true);

    // `htu` must match the real request: scheme + the `Host` header the
    // server actually sees + path, not an arbitrary placeholder.
    let proof = build_dpop_proof("GET", "http://resource.example/data", "proof-jti-1");
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/data")
        .header("Host", "resource.example")
        .header("Authorization", format!("Bearer {access_token}"))
        .header("dpop", proof.clone())
        .body(axum::body::Body::empty())
        .unwrap();

    let response = tower::ServiceExt::oneshot(resource_app.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Replaying the identical proof (same jti) must be rejected.
    let replay = axum::http::Request::builder()
        .method("GET")
        .uri("/data")
        .header("Host", "resource.example")
        .header("Authorization", format!("Bearer {access_token}"))
        .header("dpop", proof)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(resource_app, replay).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_dpop_proof_is_rejected_when_required() {
    let state = helpers::test_auth_state();
    let base_url = spawn_auth_server(state).await;
    let resource_app = helpers::resource_test_router(format!("{base_url}/introspect"), true);

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/data")
        .header("Host", "resource.example")
        .header("Authorization", "Bearer whatever")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(resource_app, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
