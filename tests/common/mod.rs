//! Common test utilities for E2E tests

#![allow(dead_code)]

use async_trait::async_trait;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustpub::data::SigningIdentity;
use rustpub::error::AppError;
use rustpub::federation::{FetchedDocument, Transport, sign_request};
use rustpub::{AppState, config};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const DOMAIN: &str = "example.org";
pub const LOCAL_USER: &str = "alice";
pub const REMOTE_ACTOR: &str = "https://remote.example/users/bob";

/// In-memory transport: serves registered documents, records deliveries.
#[derive(Default)]
pub struct FakeTransport {
    documents: Mutex<HashMap<String, Value>>,
    delivered: Mutex<Vec<(String, Value)>>,
    post_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn serve(&self, uri: &str, body: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(uri.to_string(), body);
    }

    pub fn delivered(&self) -> Vec<(String, Value)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Hold every POST for `delay`, or until cancelled.
    pub fn set_post_delay(&self, delay: Duration) {
        *self.post_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(
        &self,
        uri: &str,
        _identity: &SigningIdentity,
        _cancel: &CancellationToken,
    ) -> Result<FetchedDocument, AppError> {
        let body = self
            .documents
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| AppError::Delivery {
                uri: uri.to_string(),
                status: Some(404),
                reason: "not found".to_string(),
            })?;
        Ok(FetchedDocument {
            url: uri.to_string(),
            body,
        })
    }

    async fn post(
        &self,
        uri: &str,
        payload: &Value,
        _identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let delay = *self.post_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
            }
        }
        self.delivered
            .lock()
            .unwrap()
            .push((uri.to_string(), payload.clone()));
        Ok(())
    }
}

/// A remote actor with a real keypair
pub struct RemoteActor {
    pub uri: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl RemoteActor {
    pub fn generate(uri: &str) -> Self {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            uri: uri.to_string(),
            private_key_pem: private_key
                .to_pkcs8_pem(LineEnding::LF)
                .unwrap()
                .to_string(),
            public_key_pem: public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    pub fn document(&self) -> Value {
        json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": self.uri,
            "type": "Person",
            "preferredUsername": "bob",
            "name": "Bob",
            "summary": "<p>remote</p>",
            "inbox": format!("{}/inbox", self.uri),
            "publicKey": {
                "id": self.key_id(),
                "owner": self.uri,
                "publicKeyPem": self.public_key_pem
            }
        })
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub transport: Arc<FakeTransport>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: db_path,
            max_connections: 4,
        },
        federation: config::FederationConfig {
            key_bits: 1024,
            ..Default::default()
        },
        delivery: config::DeliveryConfig {
            workers: 2,
            queue_capacity: 16,
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_secs: 1,
            drain_timeout_secs: 5,
        },
        admin: config::AdminConfig {
            username: LOCAL_USER.to_string(),
            display_name: "Alice".to_string(),
            note: Some("Test account".to_string()),
            email: Some("alice@example.org".to_string()),
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        rustpub::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        let transport = Arc::new(FakeTransport::default());
        let state = AppState::with_transport(config, transport.clone())
            .await
            .unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = rustpub::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            transport,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// POST `body` to `path`, signed by `signer`.
    pub async fn post_signed(
        &self,
        path: &str,
        body: &[u8],
        signer: &RemoteActor,
    ) -> reqwest::Response {
        let url = self.url(path);
        let signed = sign_request(
            "POST",
            &url,
            Some(body),
            &signer.private_key_pem,
            &signer.key_id(),
        )
        .unwrap();

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }
        request.body(body.to_vec()).send().await.unwrap()
    }
}
