//! Fixtures shared by federation unit tests.

use async_trait::async_trait;
use chrono::Utc;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::transport::{FetchedDocument, Transport};
use crate::data::{Account, Actor, ActorType, Database, LocalAccount, SigningIdentity};
use crate::error::AppError;

pub(crate) fn generate_test_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("private key pem")
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .expect("public key pem");

    (private_key_pem, public_key_pem)
}

pub(crate) async fn test_db() -> (Arc<Database>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::connect(&temp_dir.path().join("test.db"))
        .await
        .unwrap();
    (Arc::new(db), temp_dir)
}

/// Provision `name` on example.org with a fresh keypair.
pub(crate) async fn local_account(db: &Database, name: &str) -> LocalAccount {
    let (private_key_pem, public_key_pem) = generate_test_keypair();
    let actor = Actor::new(
        ActorType::LocalPerson,
        format!("https://example.org/users/{name}"),
        name,
        "example.org",
        public_key_pem,
    );
    let account = Account {
        actor_id: actor.id.clone(),
        email: None,
        private_key_pem,
        created_at: Utc::now(),
    };
    db.create_local_account(&actor, &account).await.unwrap()
}

pub(crate) fn test_identity() -> SigningIdentity {
    SigningIdentity {
        key_id: "https://example.org/users/admin#main-key".to_string(),
        private_key_pem: "unused by fake transports".to_string(),
    }
}

pub(crate) fn person_document(uri: &str, name: &str, public_key_pem: &str) -> Value {
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": uri,
        "type": "Person",
        "preferredUsername": name,
        "name": format!("{name} display"),
        "summary": "<p>bio<script>alert(1)</script></p>",
        "manuallyApprovesFollowers": false,
        "inbox": format!("{uri}/inbox"),
        "endpoints": { "sharedInbox": "https://remote.example/inbox" },
        "icon": { "type": "Image", "url": format!("{uri}/avatar.png") },
        "publicKey": {
            "id": format!("{uri}#main-key"),
            "owner": uri,
            "publicKeyPem": public_key_pem
        }
    })
}

pub(crate) fn note_document(uri: &str, owner: &str, in_reply_to: Option<&str>) -> Value {
    json!({
        "id": uri,
        "type": "Note",
        "attributedTo": owner,
        "inReplyTo": in_reply_to,
        "content": format!("<p>note {uri}</p>"),
        "published": "2024-06-01T12:00:00Z"
    })
}

/// In-memory [`Transport`] with scripted documents and POST failures.
#[derive(Default)]
pub(crate) struct FakeTransport {
    documents: Mutex<HashMap<String, FetchedDocument>>,
    get_calls: Mutex<Vec<String>>,
    post_attempts: Mutex<Vec<(String, Value)>>,
    delivered: Mutex<Vec<(String, Value)>>,
    post_failures: Mutex<HashMap<String, VecDeque<Option<u16>>>>,
    get_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body` at `uri`, with the response URL equal to `uri`.
    pub(crate) fn serve(&self, uri: &str, body: Value) {
        self.serve_from(uri, uri, body);
    }

    /// Serve `body` at `uri` as if redirected to `final_url`.
    pub(crate) fn serve_from(&self, uri: &str, final_url: &str, body: Value) {
        self.documents.lock().unwrap().insert(
            uri.to_string(),
            FetchedDocument {
                url: final_url.to_string(),
                body,
            },
        );
    }

    pub(crate) fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    /// Make the next POSTs to `inbox` fail; `None` is a network error.
    pub(crate) fn fail_posts(&self, inbox: &str, failures: &[Option<u16>]) {
        self.post_failures
            .lock()
            .unwrap()
            .entry(inbox.to_string())
            .or_default()
            .extend(failures.iter().copied());
    }

    pub(crate) fn get_count(&self, uri: &str) -> usize {
        self.get_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == uri)
            .count()
    }

    pub(crate) fn total_gets(&self) -> usize {
        self.get_calls.lock().unwrap().len()
    }

    pub(crate) fn post_attempts(&self) -> Vec<(String, Value)> {
        self.post_attempts.lock().unwrap().clone()
    }

    pub(crate) fn delivered(&self) -> Vec<(String, Value)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(
        &self,
        uri: &str,
        _identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, AppError> {
        self.get_calls.lock().unwrap().push(uri.to_string());

        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        self.documents
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| AppError::Delivery {
                uri: uri.to_string(),
                status: Some(404),
                reason: "not found".to_string(),
            })
    }

    async fn post(
        &self,
        uri: &str,
        payload: &Value,
        _identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.post_attempts
            .lock()
            .unwrap()
            .push((uri.to_string(), payload.clone()));

        let failure = self
            .post_failures
            .lock()
            .unwrap()
            .get_mut(uri)
            .and_then(|queue| queue.pop_front());
        if let Some(status) = failure {
            return Err(AppError::Delivery {
                uri: uri.to_string(),
                status,
                reason: "scripted failure".to_string(),
            });
        }

        self.delivered
            .lock()
            .unwrap()
            .push((uri.to_string(), payload.clone()));
        Ok(())
    }
}
