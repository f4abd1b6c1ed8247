//! Inbox ingestion
//!
//! A request is verified before its body is read as an activity. Only a
//! verified, well-formed JSON object is stored, and it is stored before the
//! caller acknowledges it.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::document::InboundActivity;
use super::signature::{PublicKeyLookup, key_id_matches_actor, verify_request};
use crate::data::{Database, NewInboxActivity};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_RECEIVED_TOTAL, SIGNATURE_FAILURES_TOTAL};

/// What happened to an inbound POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Stored with this arrival id
    Accepted { id: i64 },
    /// Signature check failed; the body was not looked at
    Rejected { reason: String },
}

pub struct InboxProcessor {
    db: Arc<Database>,
    keys: Arc<dyn PublicKeyLookup>,
    max_skew_secs: i64,
}

impl InboxProcessor {
    pub fn new(db: Arc<Database>, keys: Arc<dyn PublicKeyLookup>, max_skew_secs: i64) -> Self {
        Self {
            db,
            keys,
            max_skew_secs,
        }
    }

    /// Verify, decode and persist one inbound activity.
    ///
    /// # Arguments
    /// * `method` - HTTP method of the request
    /// * `path_and_query` - Request target as received
    /// * `headers` - Request headers (Host, Date, Digest, Signature)
    /// * `body` - Raw request body
    ///
    /// # Errors
    /// - `MalformedActivity` when a verified body is not a JSON object
    /// - `Cancelled` and storage errors
    pub async fn receive(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<InboxOutcome, AppError> {
        let verified = match verify_request(
            method,
            path_and_query,
            headers,
            Some(body),
            self.keys.as_ref(),
            self.max_skew_secs,
            cancel,
        )
        .await
        {
            Ok(verified) => verified,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(error) if error.is_local_failure() => return Err(error),
            Err(error) => {
                let reason = match &error {
                    AppError::KeyLookup { .. } => "key_lookup",
                    _ => "invalid",
                };
                SIGNATURE_FAILURES_TOTAL.with_label_values(&[reason]).inc();
                tracing::warn!(path = path_and_query, error = %error, "Rejected inbox request");
                return Ok(InboxOutcome::Rejected {
                    reason: error.to_string(),
                });
            }
        };

        let activity = InboundActivity::parse(body)?;

        if let Some(actor_uri) = &activity.actor_uri {
            if !key_id_matches_actor(&verified.key_id, actor_uri) {
                tracing::warn!(
                    key_id = %verified.key_id,
                    actor = %actor_uri,
                    "Activity actor differs from signing key owner"
                );
            }
        }

        let object_json = String::from_utf8(body.to_vec())
            .map_err(|_| AppError::MalformedActivity("body is not UTF-8".to_string()))?;
        let id = self
            .db
            .insert_activity(&NewInboxActivity {
                activity_type: activity.kind.as_ref().map(|kind| kind.as_str().to_string()),
                actor_uri: activity.actor_uri.clone(),
                key_id: verified.key_id,
                object_json,
            })
            .await?;

        let label = activity
            .kind
            .as_ref()
            .map(|kind| kind.metric_label())
            .unwrap_or("none");
        ACTIVITIES_RECEIVED_TOTAL.with_label_values(&[label]).inc();
        tracing::info!(
            id,
            activity_type = label,
            actor = activity.actor_uri.as_deref().unwrap_or("-"),
            "Stored inbound activity"
        );

        Ok(InboxOutcome::Accepted { id })
    }
}
