//! Integration tests for the transit encryption service
//!
//! Boots the real API and peer-cache servers on ephemeral ports and drives
//! them over HTTP, sharing the key store with the test so TTL metadata can
//! be asserted directly.

use enclave::keys::TransitKey;
use enclave::storage::KeyStore;
use enclave::{Config, Server};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const TOKEN: &str = "integration-test-token";

struct TestService {
    api_base: String,
    peer_base: String,
    storage: Arc<KeyStore>,
    client: reqwest::Client,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), enclave::server::ServerError>>,
}

impl TestService {
    async fn start() -> Self {
        let config = Config {
            bearer_token: TOKEN.to_string(),
            sweep_interval: Duration::from_millis(20),
            announce_token: false,
            ..Config::default()
        };
        let storage = Arc::new(KeyStore::new(config.sweep_interval));
        let server = Server::with_storage(config, Arc::clone(&storage));

        let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_base = format!("http://{}", api_listener.local_addr().unwrap());
        let peer_base = format!("http://{}", peer_listener.local_addr().unwrap());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(api_listener, peer_listener, async {
            let _ = rx.await;
        }));

        Self {
            api_base,
            peer_base,
            storage,
            client: reqwest::Client::new(),
            shutdown: Some(tx),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn create_key(&self, name: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/transit/keys/{name}")))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap()
    }

    async fn encrypt(&self, name: &str, payload: Vec<u8>) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/transit/encrypt/{name}")))
            .bearer_auth(TOKEN)
            .body(payload)
            .send()
            .await
            .unwrap()
    }

    async fn decrypt(&self, name: &str, payload: Vec<u8>) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/transit/decrypt/{name}")))
            .bearer_auth(TOKEN)
            .body(payload)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_requests_without_bearer_are_unauthorized() {
    let service = TestService::start().await;

    let response = service
        .client
        .post(service.url("/transit/keys/locked"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = service
        .client
        .post(service.url("/transit/keys/locked"))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = service.create_key("locked").await;
    assert_eq!(response.status(), 204);
}

#[tokio::test]
async fn test_create_encrypt_decrypt_round_trip() {
    let service = TestService::start().await;

    assert_eq!(service.create_key("test-key").await.status(), 204);

    let response = service.encrypt("test-key", b"Hello, World!".to_vec()).await;
    assert_eq!(response.status(), 200);
    let ciphertext = response.bytes().await.unwrap().to_vec();
    assert!(!ciphertext.is_empty());
    assert_ne!(ciphertext, b"Hello, World!".to_vec());

    let response = service.decrypt("test-key", ciphertext).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"Hello, World!");
}

#[tokio::test]
async fn test_create_with_ttl_header() {
    let service = TestService::start().await;

    let response = service
        .client
        .post(service.url("/transit/keys/timed"))
        .bearer_auth(TOKEN)
        .header("X-Key-TTL", "55m")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let key = service.storage.get("timed").await.unwrap();
    assert_eq!(key.ttl(), Duration::from_secs(55 * 60));
}

#[tokio::test]
async fn test_create_existing_extends_ttl_without_regenerating() {
    let service = TestService::start().await;

    assert_eq!(service.create_key("stable").await.status(), 204);
    let ciphertext = service
        .encrypt("stable", b"encrypted under first material".to_vec())
        .await
        .bytes()
        .await
        .unwrap()
        .to_vec();

    // Re-create with a different TTL: must extend in place
    let response = service
        .client
        .post(service.url("/transit/keys/stable?ttl=55m"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let key = service.storage.get("stable").await.unwrap();
    assert_eq!(key.ttl(), Duration::from_secs(55 * 60));

    // Old ciphertext still decrypts: the material did not change
    let response = service.decrypt("stable", ciphertext).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"encrypted under first material"
    );
}

#[tokio::test]
async fn test_delete_is_idempotent_over_http() {
    let service = TestService::start().await;

    let response = service
        .client
        .delete(service.url("/transit/keys/never-created"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    assert_eq!(service.create_key("doomed").await.status(), 204);
    for _ in 0..2 {
        let response = service
            .client
            .delete(service.url("/transit/keys/doomed"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
    }

    let response = service.encrypt("doomed", b"gone".to_vec()).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let service = TestService::start().await;
    assert_eq!(service.create_key("bulk").await.status(), 204);

    // ~9KB, no trailing NUL bytes
    let payload: Vec<u8> = (0..9 * 1024).map(|i| (i % 251 + 1) as u8).collect();

    let ciphertext = service
        .encrypt("bulk", payload.clone())
        .await
        .bytes()
        .await
        .unwrap()
        .to_vec();
    assert!(ciphertext.len() > payload.len());

    let response = service.decrypt("bulk", ciphertext).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), payload);
}

#[tokio::test]
async fn test_rsa_key_round_trip() {
    let service = TestService::start().await;

    let response = service
        .client
        .post(service.url("/transit/keys/rsa-key?type=rsa&size=2048"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let key = service.storage.get("rsa-key").await.unwrap();
    assert_eq!(key.key_type(), "rsa");
    assert_eq!(key.size(), "2048");

    let ciphertext = service
        .encrypt("rsa-key", b"Hello, RSA transit!".to_vec())
        .await
        .bytes()
        .await
        .unwrap()
        .to_vec();
    let response = service.decrypt("rsa-key", ciphertext).await;
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"Hello, RSA transit!"
    );
}

#[tokio::test]
async fn test_encrypt_with_missing_key_is_not_found() {
    let service = TestService::start().await;
    let response = service.encrypt("ghost", b"data".to_vec()).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_expired_key_disappears() {
    let service = TestService::start().await;

    let response = service
        .client
        .post(service.url("/transit/keys/fleeting"))
        .bearer_auth(TOKEN)
        .header("X-Key-TTL", "40ms")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = service.encrypt("fleeting", b"too late".to_vec()).await;
    assert_eq!(response.status(), 404);
    assert_eq!(service.storage.len(), 0, "sweeper evicted the expired key");
}

#[tokio::test]
async fn test_peer_endpoint_serves_packed_envelopes() {
    let service = TestService::start().await;
    assert_eq!(service.create_key("shared").await.status(), 204);

    let response = service
        .client
        .get(format!("{}/_group/keys/shared", service.peer_base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let packed = response.bytes().await.unwrap();
    let key = TransitKey::unpack(&packed).unwrap();
    assert_eq!(key.name(), "shared");
    assert_eq!(key.key_type(), "kyber");

    let response = service
        .client
        .get(format!("{}/_group/keys/unknown", service.peer_base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_graceful_shutdown_reports_success() {
    let mut service = TestService::start().await;
    assert_eq!(service.create_key("until-the-end").await.status(), 204);

    service.shutdown.take().unwrap().send(()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), &mut service.handle)
        .await
        .expect("shutdown did not complete in time")
        .unwrap();
    assert!(result.is_ok(), "expected clean shutdown, got {result:?}");
}
