//! Find-or-create for remote actors
//!
//! Storage is the cache: a hit never touches the network. On a miss the
//! actor document is fetched, validated and inserted; if a concurrent caller
//! inserted the same URI first, its row is returned instead.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::document::{ActorDocument, authority_of};
use super::signature::{PublicKeyLookup, key_owner_uri};
use super::transport::Transport;
use crate::data::{Actor, Database, InsertOutcome, SigningIdentity};
use crate::error::AppError;
use crate::metrics::{RESOLVER_HITS_TOTAL, RESOLVER_MISSES_TOTAL};

/// Map a transport failure on a fetch to `RemoteFetch`.
///
/// Cancellation and refused destinations keep their own variants.
pub(crate) fn remote_fetch_error(uri: &str, error: AppError) -> AppError {
    match error {
        AppError::Delivery { status, reason, .. } => AppError::RemoteFetch {
            uri: uri.to_string(),
            reason: match status {
                Some(code) => format!("status {}: {}", code, reason),
                None => reason,
            },
        },
        other => other,
    }
}

pub struct ActorResolver {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    /// Identity used to sign fetches (authorized-fetch servers require it)
    identity: SigningIdentity,
}

impl ActorResolver {
    pub fn new(db: Arc<Database>, transport: Arc<dyn Transport>, identity: SigningIdentity) -> Self {
        Self {
            db,
            transport,
            identity,
        }
    }

    /// Return the stored actor for `uri`, fetching and storing it on first use.
    ///
    /// # Errors
    /// - `RemoteFetch` when the document cannot be fetched or decoded
    /// - `MalformedActor` when required fields are missing or the id differs
    /// - `ActorConflict` when (name, domain) belongs to another URI
    #[tracing::instrument(skip_all, fields(uri = %uri))]
    pub async fn find_or_create(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_actor_by_uri(uri).await? {
            RESOLVER_HITS_TOTAL.with_label_values(&["actor"]).inc();
            return Ok(actor);
        }
        RESOLVER_MISSES_TOTAL.with_label_values(&["actor"]).inc();

        let fetched = self
            .transport
            .get(uri, &self.identity, cancel)
            .await
            .map_err(|e| remote_fetch_error(uri, e))?;

        let document = ActorDocument::from_value(&fetched.body).ok_or_else(|| {
            AppError::MalformedActor {
                uri: uri.to_string(),
                reason: "not an actor object".to_string(),
            }
        })?;
        let domain = authority_of(&fetched.url).ok_or_else(|| AppError::RemoteFetch {
            uri: uri.to_string(),
            reason: format!("response URL {} has no host", fetched.url),
        })?;
        let actor = document.to_actor(uri, &domain)?;

        match self.db.insert_actor(&actor).await? {
            InsertOutcome::Inserted(actor) => {
                tracing::info!(
                    actor_id = %actor.id,
                    acct = %actor.acct(),
                    "Stored remote actor"
                );
                Ok(actor)
            }
            InsertOutcome::Conflict => match self.db.get_actor_by_uri(uri).await? {
                Some(existing) => {
                    tracing::debug!(actor_id = %existing.id, "Actor inserted concurrently");
                    Ok(existing)
                }
                None => {
                    tracing::warn!(
                        name = %actor.name,
                        domain = %actor.domain,
                        "Actor name already bound to a different URI"
                    );
                    Err(AppError::ActorConflict {
                        uri: uri.to_string(),
                        name: actor.name,
                        domain: actor.domain,
                    })
                }
            },
        }
    }
}

#[async_trait]
impl PublicKeyLookup for ActorResolver {
    /// The key owner is the keyId without its fragment. A failed resolution
    /// is retried once before giving up. Cancellation and local storage
    /// failures are returned as they are.
    async fn public_key_pem(
        &self,
        key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        let owner = key_owner_uri(key_id);

        let actor = match self.find_or_create(owner, cancel).await {
            Ok(actor) => actor,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(error) if error.is_local_failure() => return Err(error),
            Err(first) => {
                tracing::debug!(key_id, error = %first, "Key owner lookup failed, retrying");
                match self.find_or_create(owner, cancel).await {
                    Ok(actor) => actor,
                    Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                    Err(error) if error.is_local_failure() => return Err(error),
                    Err(error) => {
                        return Err(AppError::KeyLookup {
                            key_id: key_id.to_string(),
                            reason: error.to_string(),
                        });
                    }
                }
            }
        };

        Ok(actor.public_key_pem)
    }
}
