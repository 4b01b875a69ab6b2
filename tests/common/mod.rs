//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oidc_pkce_client::store::now_millis;
use oidc_pkce_client::{
    ClientSettings, EventKind, KeyValueStore, MemoryLocation, MemoryStore, OidcClient, OidcEvent,
};

pub const CLIENT_ID: &str = "spa";
pub const APP_URL: &str = "http://app.test/home";

/// Unsigned JWT for `sub` expiring `secs` from now.
pub fn jwt(sub: &str, secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = json!({
        "sub": sub,
        "aud": CLIENT_ID,
        "exp": now_millis() / 1000 + secs,
        "jti": uuid::Uuid::new_v4().to_string(),
        "realm_access": { "roles": ["user"] }
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

pub fn discovery(base: &str) -> serde_json::Value {
    json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/auth"),
        "token_endpoint": format!("{base}/token"),
        "end_session_endpoint": format!("{base}/logout"),
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "response_modes_supported": ["query", "fragment"]
    })
}

pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery(&server.uri())))
        .mount(server)
        .await;
}

pub fn token_body(access: &str, refresh: Option<&str>, id: Option<&str>) -> serde_json::Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "bearer",
        "expires_in": 300
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    if let Some(id) = id {
        body["id_token"] = json!(id);
    }
    body
}

/// Raw durable entry as the client serializes it.
pub fn stored(value: &str, expire_in: i64) -> String {
    json!({ "expireIn": expire_in, "value": value }).to_string()
}

pub fn store_key(server: &MockServer, postfix: &str) -> String {
    format!("OIDC-MIF:{postfix}{}:{CLIENT_ID}", server.uri())
}

/// Write a token set straight into shared storage, as another context would.
pub fn seed_tokens(
    store: &MemoryStore,
    server: &MockServer,
    access: &str,
    access_expire_in: i64,
    refresh: Option<&str>,
) {
    store
        .set(&store_key(server, "access_token:"), &stored(access, access_expire_in))
        .unwrap();
    if let Some(refresh) = refresh {
        store
            .set(
                &store_key(server, "refresh_token:"),
                &stored(refresh, now_millis() + 3_600_000),
            )
            .unwrap();
    }
}

/// One browsing context: a client plus handles on its storage and address.
pub struct Tab {
    pub client: OidcClient,
    pub location: MemoryLocation,
    pub durable: MemoryStore,
    pub session: MemoryStore,
}

pub fn settings(server: &MockServer) -> ClientSettings {
    ClientSettings::new(server.uri(), CLIENT_ID)
}

/// Build a tab attached to `shared` durable storage.
pub fn tab(
    settings: ClientSettings,
    shared: &MemoryStore,
    session: MemoryStore,
    href: &str,
) -> Tab {
    let location = MemoryLocation::new(Url::parse(href).unwrap());
    let durable = shared.attach();
    let client = OidcClient::builder(settings, Arc::new(location.clone()))
        .shared_store(durable.clone())
        .session_store(Arc::new(session.clone()))
        .build()
        .unwrap();
    Tab {
        client,
        location,
        durable,
        session,
    }
}

pub type Recorded = Arc<Mutex<Vec<OidcEvent>>>;

pub fn record(client: &OidcClient) -> Recorded {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::Login, EventKind::Logout, EventKind::AccessTokenUpdated] {
        let sink = Arc::clone(&seen);
        client.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
    }
    seen
}

/// Let spawned background tasks run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
