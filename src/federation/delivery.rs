//! Activity delivery
//!
//! Follow, Unfollow, Like and Unlike on behalf of a local account. The target
//! inbox is resolved before anything is built or sent, so a target without an
//! inbox never causes network traffic. Delivery records nothing locally.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::activity::{Verb, activity_id, build_activity_with_id};
use super::queue::{DeliveryJob, DeliveryQueue};
use super::transport::Transport;
use crate::data::{Actor, Database, LocalAccount, Status};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_SENT_TOTAL;

/// Outcome of a single delivery request
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub activity_id: String,
    pub inbox: String,
    /// `true` when handed to the delivery queue rather than sent inline
    pub queued: bool,
}

/// Activity delivery service
///
/// Sends inline through the transport unless a [`DeliveryQueue`] is attached.
pub struct DeliveryService {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    queue: Option<Arc<DeliveryQueue>>,
}

impl DeliveryService {
    pub fn new(db: Arc<Database>, transport: Arc<dyn Transport>) -> Self {
        Self {
            db,
            transport,
            queue: None,
        }
    }

    /// Route deliveries through `queue` instead of sending inline.
    pub fn with_queue(mut self, queue: Arc<DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Send Follow to `target`'s inbox
    pub async fn follow(
        &self,
        account: &LocalAccount,
        target: &Actor,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError> {
        let inbox = actor_inbox(target)?;
        self.dispatch(Verb::Follow, account, inbox, &target.uri, cancel)
            .await
    }

    /// Send Undo{Follow} to `target`'s inbox
    pub async fn unfollow(
        &self,
        account: &LocalAccount,
        target: &Actor,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError> {
        let inbox = actor_inbox(target)?;
        self.dispatch(Verb::Unfollow, account, inbox, &target.uri, cancel)
            .await
    }

    /// Send Like to the inbox of `target`'s owner
    pub async fn like(
        &self,
        account: &LocalAccount,
        target: &Status,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError> {
        let inbox = self.status_inbox(target).await?;
        self.dispatch(Verb::Like, account, inbox, &target.uri, cancel)
            .await
    }

    /// Send Undo{Like} to the inbox of `target`'s owner
    pub async fn unlike(
        &self,
        account: &LocalAccount,
        target: &Status,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError> {
        let inbox = self.status_inbox(target).await?;
        self.dispatch(Verb::Unlike, account, inbox, &target.uri, cancel)
            .await
    }

    async fn status_inbox(&self, status: &Status) -> Result<String, AppError> {
        let owner = self
            .db
            .get_actor(&status.actor_id)
            .await?
            .ok_or(AppError::NotFound)?;
        actor_inbox(&owner)
    }

    async fn dispatch(
        &self,
        verb: Verb,
        account: &LocalAccount,
        inbox: String,
        target_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, AppError> {
        let actor_uri = &account.actor.uri;
        let id = activity_id(actor_uri, verb);
        let activity = build_activity_with_id(&id, verb, actor_uri, target_uri, None);
        let identity = account.signing_identity();

        match &self.queue {
            Some(queue) => {
                queue
                    .enqueue(DeliveryJob {
                        inbox: inbox.clone(),
                        activity,
                        identity,
                    })
                    .await?;
                tracing::debug!(%verb, activity_id = %id, %inbox, "Queued delivery");
                Ok(DeliveryReceipt {
                    activity_id: id,
                    inbox,
                    queued: true,
                })
            }
            None => {
                self.transport
                    .post(&inbox, &activity, &identity, cancel)
                    .await?;
                ACTIVITIES_SENT_TOTAL
                    .with_label_values(&[verb.activity_type()])
                    .inc();
                tracing::info!(%verb, activity_id = %id, %inbox, "Delivered activity");
                Ok(DeliveryReceipt {
                    activity_id: id,
                    inbox,
                    queued: false,
                })
            }
        }
    }
}

fn actor_inbox(actor: &Actor) -> Result<String, AppError> {
    actor
        .inbox_url()
        .ok_or_else(|| AppError::NoInbox(actor.uri.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::data::{ActorType, EntityId, InsertOutcome};
    use crate::federation::test_support::{FakeTransport, local_account, test_db};
    use crate::federation::transport::MockTransport;
    use chrono::Utc;

    const BOB: &str = "https://remote.example/users/bob";
    const BOB_INBOX: &str = "https://remote.example/users/bob/inbox";

    async fn store_remote(db: &Database, inbox: Option<&str>) -> Actor {
        let mut actor = Actor::new(ActorType::Person, BOB, "bob", "remote.example", "PEM");
        actor.inbox = inbox.map(str::to_string);
        match db.insert_actor(&actor).await.unwrap() {
            InsertOutcome::Inserted(actor) => actor,
            InsertOutcome::Conflict => panic!("fixture actor already stored"),
        }
    }

    async fn store_status(db: &Database, owner: &Actor) -> Status {
        let status = Status {
            id: EntityId::new().0,
            uri: "https://remote.example/notes/1".to_string(),
            actor_id: owner.id.clone(),
            in_reply_to_uri: None,
            in_reply_to_id: None,
            content: "<p>hi</p>".to_string(),
            content_warning: None,
            sensitive: false,
            published_at: Utc::now(),
            created_at: Utc::now(),
        };
        match db.insert_status(&status).await.unwrap() {
            InsertOutcome::Inserted(status) => status,
            InsertOutcome::Conflict => panic!("fixture status already stored"),
        }
    }

    #[tokio::test]
    async fn follow_posts_to_target_inbox() {
        let (db, _dir) = test_db().await;
        let alice = local_account(&db, "alice").await;
        let bob = store_remote(&db, Some(BOB_INBOX)).await;
        let transport = FakeTransport::new();
        let service = DeliveryService::new(db, transport.clone());

        let receipt = service
            .follow(&alice, &bob, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!receipt.queued);
        assert_eq!(receipt.inbox, BOB_INBOX);
        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, BOB_INBOX);
        assert_eq!(delivered[0].1["type"], "Follow");
        assert_eq!(delivered[0].1["actor"], alice.actor.uri);
        assert_eq!(delivered[0].1["object"], BOB);
        assert_eq!(delivered[0].1["id"], receipt.activity_id);
    }

    #[tokio::test]
    async fn unlike_goes_to_status_owner() {
        let (db, _dir) = test_db().await;
        let alice = local_account(&db, "alice").await;
        let bob = store_remote(&db, Some(BOB_INBOX)).await;
        let status = store_status(&db, &bob).await;
        let transport = FakeTransport::new();
        let service = DeliveryService::new(db, transport.clone());

        service
            .unlike(&alice, &status, &CancellationToken::new())
            .await
            .unwrap();

        let delivered = transport.delivered();
        assert_eq!(delivered[0].0, BOB_INBOX);
        assert_eq!(delivered[0].1["type"], "Undo");
        assert_eq!(delivered[0].1["object"]["type"], "Like");
        assert_eq!(delivered[0].1["object"]["object"], status.uri);
    }

    #[tokio::test]
    async fn like_without_inbox_makes_no_network_call() {
        let (db, _dir) = test_db().await;
        let alice = local_account(&db, "alice").await;
        let bob = store_remote(&db, None).await;
        let status = store_status(&db, &bob).await;
        // No expectations: any transport call fails the test
        let transport = MockTransport::new();
        let service = DeliveryService::new(db, Arc::new(transport));

        match service
            .like(&alice, &status, &CancellationToken::new())
            .await
        {
            Err(AppError::NoInbox(uri)) => assert_eq!(uri, BOB),
            other => panic!("expected no inbox error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unfollow_without_inbox_fails() {
        let (db, _dir) = test_db().await;
        let alice = local_account(&db, "alice").await;
        let bob = store_remote(&db, None).await;
        let transport = FakeTransport::new();
        let service = DeliveryService::new(db, transport.clone());

        let result = service
            .unfollow(&alice, &bob, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::NoInbox(_))));
        assert!(transport.post_attempts().is_empty());
    }

    #[tokio::test]
    async fn inline_failure_is_returned() {
        let (db, _dir) = test_db().await;
        let alice = local_account(&db, "alice").await;
        let bob = store_remote(&db, Some(BOB_INBOX)).await;
        let transport = FakeTransport::new();
        transport.fail_posts(BOB_INBOX, &[Some(403)]);
        let service = DeliveryService::new(db, transport);

        match service
            .follow(&alice, &bob, &CancellationToken::new())
            .await
        {
            Err(AppError::Delivery { status, .. }) => assert_eq!(status, Some(403)),
            other => panic!("expected delivery error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_delivery_returns_before_sending() {
        let (db, _dir) = test_db().await;
        let alice = local_account(&db, "alice").await;
        let bob = store_remote(&db, Some(BOB_INBOX)).await;
        let transport = FakeTransport::new();
        let queue = Arc::new(DeliveryQueue::start(
            &DeliveryConfig {
                workers: 2,
                queue_capacity: 8,
                max_attempts: 2,
                base_backoff_ms: 1,
                max_backoff_secs: 1,
                drain_timeout_secs: 1,
            },
            db.clone(),
            transport.clone(),
            CancellationToken::new(),
        ));
        let service = DeliveryService::new(db, transport.clone()).with_queue(queue.clone());

        let receipt = service
            .follow(&alice, &bob, &CancellationToken::new())
            .await
            .unwrap();
        assert!(receipt.queued);

        queue.close().await;
        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1["id"], receipt.activity_id);
    }
}
