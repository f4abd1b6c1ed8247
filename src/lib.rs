//! rustpub - ActivityPub federation core
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor documents, inboxes, collections                    │
//! │  - WebFinger, NodeInfo, host-meta                           │
//! │  - Prometheus metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - HTTP signatures, signed transport                        │
//! │  - Actor/status resolvers (find-or-create)                  │
//! │  - Delivery service and worker queue                        │
//! │  - Inbox processor                                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx), embedded migrations                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use federation::{
    ActorResolver, DeliveryQueue, DeliveryService, HttpTransport, InboxProcessor, StatusResolver,
    Transport,
};

/// Application state shared across all handlers
///
/// Cloned for each request; every component is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Signed outbound HTTP
    pub transport: Arc<dyn Transport>,

    /// Remote actor find-or-create
    pub actors: Arc<ActorResolver>,

    /// Remote status find-or-create
    ///
    /// No route resolves statuses itself. Embedders call this to turn a
    /// status URI into a stored [`data::Status`] before handing it to
    /// `delivery.like` / `delivery.unlike`.
    pub statuses: Arc<StatusResolver>,

    /// Outbound Follow/Like and their undos
    pub delivery: Arc<DeliveryService>,

    /// Worker pool behind `delivery`
    pub delivery_queue: Arc<DeliveryQueue>,

    /// Inbound activity ingestion
    pub inbox: Arc<InboxProcessor>,

    /// Instance account; signs resolver fetches
    pub instance_account: Arc<data::LocalAccount>,

    /// Cancelled on shutdown; parent of every background operation
    pub shutdown: CancellationToken,

    pub started_at: Instant,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database and run migrations
    /// 2. Build the HTTP transport
    /// 3. Provision the admin account
    /// 4. Wire resolvers, delivery queue and inbox processor
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let transport =
            HttpTransport::new(&config.federation, &config.server.base_url())?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Initialize with a caller-supplied transport.
    pub async fn with_transport(
        config: config::AppConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(
            data::Database::connect_with_pool_size(
                &config.database.path,
                config.database.max_connections,
            )
            .await?,
        );

        // 2. Initialize admin user
        let instance_account = Self::ensure_admin_user(&db, &config).await?;
        let identity = instance_account.signing_identity();

        // 3. Resolvers
        let actors = Arc::new(ActorResolver::new(
            db.clone(),
            transport.clone(),
            identity.clone(),
        ));
        let statuses = Arc::new(StatusResolver::new(
            db.clone(),
            transport.clone(),
            actors.clone(),
            identity,
            config.federation.max_reply_depth,
        ));

        // 4. Delivery
        let shutdown = CancellationToken::new();
        let delivery_queue = Arc::new(DeliveryQueue::start(
            &config.delivery,
            db.clone(),
            transport.clone(),
            shutdown.clone(),
        ));
        let delivery = Arc::new(
            DeliveryService::new(db.clone(), transport.clone()).with_queue(delivery_queue.clone()),
        );

        // 5. Inbox
        let inbox = Arc::new(InboxProcessor::new(
            db.clone(),
            actors.clone(),
            config.federation.signature_max_skew_secs,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            transport,
            actors,
            statuses,
            delivery,
            delivery_queue,
            inbox,
            instance_account: Arc::new(instance_account),
            shutdown,
            started_at: Instant::now(),
        })
    }

    /// Drain the delivery queue, then cancel background work.
    ///
    /// Jobs still queued after `delivery.drain_timeout_secs` are cancelled
    /// along with any in-flight request.
    pub async fn shutdown(&self) {
        let timeout = self.config.delivery.drain_timeout();
        let mut close = std::pin::pin!(self.delivery_queue.close());
        if tokio::time::timeout(timeout, close.as_mut()).await.is_err() {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Delivery queue did not drain in time, cancelling remaining jobs"
            );
            self.shutdown.cancel();
            close.await;
        }
        self.shutdown.cancel();
        self.db.close().await;
    }

    /// Ensure admin user exists with current configuration
    ///
    /// Creates the admin actor and account with a fresh RSA keypair, or
    /// updates its display metadata if the configuration changed.
    async fn ensure_admin_user(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<data::LocalAccount, error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let username = &config.admin.username;
        let domain = &config.server.domain;
        let display_name = &config.admin.display_name;
        let note = config.admin.note.clone().unwrap_or_default();

        if let Some(mut existing) = db.get_local_account(username, domain).await? {
            if existing.actor.display_name != *display_name || existing.actor.note != note {
                db.update_actor_profile(&existing.actor.id, display_name, &note)
                    .await?;
                existing.actor.display_name = display_name.clone();
                existing.actor.note = note;
                tracing::info!(username = %username, "Admin account updated");
            } else {
                tracing::info!(username = %username, "Admin account exists");
            }
            return Ok(existing);
        }

        tracing::info!(bits = config.federation.key_bits, "Creating admin account...");

        // Key generation is CPU bound
        let bits = config.federation.key_bits;
        let private_key = tokio::task::spawn_blocking(move || {
            let mut rng = rand::thread_rng();
            RsaPrivateKey::new(&mut rng, bits)
        })
        .await
        .map_err(|e| error::AppError::Internal(e.into()))?
        .map_err(|e| error::AppError::Internal(e.into()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let mut actor = data::Actor::new(
            data::ActorType::LocalPerson,
            config.server.actor_uri(username),
            username.as_str(),
            domain.as_str(),
            public_key_pem,
        );
        actor.display_name = display_name.clone();
        actor.note = note;

        let account = data::Account {
            actor_id: actor.id.clone(),
            email: config.admin.email.clone(),
            private_key_pem,
            created_at: chrono::Utc::now(),
        };

        let created = db.create_local_account(&actor, &account).await?;

        tracing::info!(
            username = %created.actor.name,
            uri = %created.actor.uri,
            "Admin account created"
        );

        Ok(created)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router(state.config.federation.max_inbox_bytes))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state.clone())
        .merge(api::metrics_router(state.started_at))
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
