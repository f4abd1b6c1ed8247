//! Find-or-create for remote statuses
//!
//! A status is stored only after its owner. Reply ancestors are resolved
//! first so the child can record the parent's local id; the walk stops at
//! `max_depth` ancestors, on a URI already on the current chain, or on an
//! ancestor that cannot be fetched. None of those fail the original request;
//! a storage failure while walking the chain does.

use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::actor_resolver::{ActorResolver, remote_fetch_error};
use super::document::{ObjectDocument, sanitize_html};
use super::transport::Transport;
use crate::data::{Database, EntityId, InsertOutcome, SigningIdentity, Status};
use crate::error::AppError;
use crate::metrics::{RESOLVER_HITS_TOTAL, RESOLVER_MISSES_TOTAL};

pub struct StatusResolver {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    actors: Arc<ActorResolver>,
    identity: SigningIdentity,
    max_depth: usize,
}

impl StatusResolver {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        actors: Arc<ActorResolver>,
        identity: SigningIdentity,
        max_depth: usize,
    ) -> Self {
        Self {
            db,
            transport,
            actors,
            identity,
            max_depth,
        }
    }

    /// Return the stored status for `uri`, fetching it (and its owner and
    /// ancestors) on first use.
    ///
    /// # Errors
    /// - `RemoteFetch` when the status itself cannot be fetched
    /// - `MalformedStatus` when `id` or the owner is missing
    /// - any owner resolution error
    pub async fn find_or_create(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Status, AppError> {
        self.resolve(uri.to_string(), 0, Vec::new(), cancel).await
    }

    fn resolve<'a>(
        &'a self,
        uri: String,
        depth: usize,
        chain: Vec<String>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Status, AppError>> {
        Box::pin(async move {
            if let Some(status) = self.db.get_status_by_uri(&uri).await? {
                RESOLVER_HITS_TOTAL.with_label_values(&["status"]).inc();
                return Ok(status);
            }
            RESOLVER_MISSES_TOTAL.with_label_values(&["status"]).inc();

            let fetched = self
                .transport
                .get(&uri, &self.identity, cancel)
                .await
                .map_err(|e| remote_fetch_error(&uri, e))?;

            let malformed = |reason: &str| AppError::MalformedStatus {
                uri: uri.clone(),
                reason: reason.to_string(),
            };
            let document =
                ObjectDocument::from_value(&fetched.body).ok_or_else(|| malformed("not an object"))?;
            match document.id.as_deref() {
                None => return Err(malformed("missing id")),
                Some(id) if id != uri => {
                    return Err(malformed(&format!("document id {} does not match", id)));
                }
                Some(_) => {}
            }
            let owner_uri = document
                .owner_uri()
                .ok_or_else(|| malformed("missing attributedTo"))?;

            let owner = self.actors.find_or_create(&owner_uri, cancel).await?;

            let in_reply_to_uri = document.in_reply_to_uri();
            let in_reply_to_id = match &in_reply_to_uri {
                Some(parent) => {
                    self.resolve_parent(&uri, parent, depth, chain, cancel)
                        .await?
                }
                None => None,
            };

            let status = Status {
                id: EntityId::new().0,
                uri: uri.clone(),
                actor_id: owner.id,
                in_reply_to_uri,
                in_reply_to_id,
                content: document
                    .content
                    .as_deref()
                    .map(sanitize_html)
                    .unwrap_or_default(),
                content_warning: document
                    .summary
                    .as_deref()
                    .map(sanitize_html)
                    .filter(|summary| !summary.is_empty()),
                sensitive: document.sensitive.unwrap_or(false),
                published_at: document.published_at(),
                created_at: Utc::now(),
            };

            match self.db.insert_status(&status).await? {
                InsertOutcome::Inserted(status) => {
                    tracing::debug!(uri = %status.uri, depth, "Stored remote status");
                    Ok(status)
                }
                InsertOutcome::Conflict => self
                    .db
                    .get_status_by_uri(&uri)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(anyhow::anyhow!(
                            "status {} conflicted but is not stored",
                            uri
                        ))
                    }),
            }
        })
    }

    /// Local id of the parent, or `None` when the walk stops here.
    ///
    /// Remote failures end the walk. Cancellation and local storage failures
    /// are propagated.
    async fn resolve_parent(
        &self,
        child: &str,
        parent: &str,
        depth: usize,
        mut chain: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AppError> {
        chain.push(child.to_string());

        if chain.iter().any(|seen| seen == parent) {
            tracing::warn!(uri = %child, parent, "Reply chain loops, not following parent");
            return Ok(None);
        }
        if depth >= self.max_depth {
            tracing::debug!(
                uri = %child,
                parent,
                max_depth = self.max_depth,
                "Reply chain depth bound reached"
            );
            return Ok(None);
        }

        match self
            .resolve(parent.to_string(), depth + 1, chain, cancel)
            .await
        {
            Ok(status) => Ok(Some(status.id)),
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(error) if error.is_local_failure() => Err(error),
            Err(error) => {
                tracing::warn!(
                    uri = %child,
                    parent,
                    %error,
                    "Failed to resolve reply parent"
                );
                Ok(None)
            }
        }
    }
}
