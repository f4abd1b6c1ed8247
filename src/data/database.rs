//! SQLite database operations
//!
//! All database access goes through this module.
//! Unique indexes on actor and status URIs are what make concurrent
//! find-or-create safe; inserts report collisions as
//! [`InsertOutcome::Conflict`] instead of failing.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether an insert failed only because a unique index already holds the key.
fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error.is_unique_violation(),
        _ => false,
    }
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        Self::connect_with_pool_size(path, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit upper bound on pooled connections.
    pub async fn connect_with_pool_size(
        path: &Path,
        max_connections: u32,
    ) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!(error = %e, "Migration failed");
            AppError::Migration(e)
        })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Actor operations
    // =========================================================================

    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get actor by ActivityPub URI
    pub async fn get_actor_by_uri(&self, uri: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    pub async fn get_actor_by_name_domain(
        &self,
        name: &str,
        domain: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor =
            sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE name = ? AND domain = ?")
                .bind(name)
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;

        Ok(actor)
    }

    /// Insert a new actor
    ///
    /// Returns `Conflict` when the URI or (name, domain) is already taken.
    pub async fn insert_actor(&self, actor: &Actor) -> Result<InsertOutcome<Actor>, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO actors (
                id, actor_type, uri, name, domain, display_name, locked, note,
                avatar, header, inbox, public_key_pem, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.actor_type)
        .bind(&actor.uri)
        .bind(&actor.name)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(actor.locked)
        .bind(&actor.note)
        .bind(&actor.avatar)
        .bind(&actor.header)
        .bind(&actor.inbox)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(actor.clone())),
            Err(error) if is_unique_violation(&error) => Ok(InsertOutcome::Conflict),
            Err(error) => Err(error.into()),
        }
    }

    /// Update the display metadata of an actor
    pub async fn update_actor_profile(
        &self,
        actor_id: &str,
        display_name: &str,
        note: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors SET display_name = ?, note = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(display_name)
        .bind(note)
        .bind(Utc::now())
        .bind(actor_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Local account operations
    // =========================================================================

    /// Create a local actor and its account atomically
    pub async fn create_local_account(
        &self,
        actor: &Actor,
        account: &Account,
    ) -> Result<LocalAccount, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO actors (
                id, actor_type, uri, name, domain, display_name, locked, note,
                avatar, header, inbox, public_key_pem, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.actor_type)
        .bind(&actor.uri)
        .bind(&actor.name)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(actor.locked)
        .bind(&actor.note)
        .bind(&actor.avatar)
        .bind(&actor.header)
        .bind(&actor.inbox)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO accounts (actor_id, email, private_key_pem, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&account.actor_id)
        .bind(&account.email)
        .bind(&account.private_key_pem)
        .bind(account.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(LocalAccount {
            actor: actor.clone(),
            account: account.clone(),
        })
    }

    /// Get a local account by username on this instance's domain
    pub async fn get_local_account(
        &self,
        name: &str,
        domain: &str,
    ) -> Result<Option<LocalAccount>, AppError> {
        let Some(actor) = self.get_actor_by_name_domain(name, domain).await? else {
            return Ok(None);
        };
        if !actor.is_local() {
            return Ok(None);
        }

        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE actor_id = ?")
            .bind(&actor.id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account.map(|account| LocalAccount { actor, account }))
    }

    pub async fn count_local_actors(&self) -> Result<i64, AppError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM actors WHERE actor_type = 'LocalPerson'")
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }

    // =========================================================================
    // Status operations
    // =========================================================================

    pub async fn get_status(&self, id: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Get status by ActivityPub URI
    pub async fn get_status_by_uri(&self, uri: &str) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Insert a new status
    ///
    /// Returns `Conflict` when a status with the same URI already exists.
    pub async fn insert_status(&self, status: &Status) -> Result<InsertOutcome<Status>, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO statuses (
                id, uri, actor_id, in_reply_to_uri, in_reply_to_id, content,
                content_warning, sensitive, published_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.id)
        .bind(&status.uri)
        .bind(&status.actor_id)
        .bind(&status.in_reply_to_uri)
        .bind(&status.in_reply_to_id)
        .bind(&status.content)
        .bind(&status.content_warning)
        .bind(status.sensitive)
        .bind(status.published_at)
        .bind(status.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(status.clone())),
            Err(error) if is_unique_violation(&error) => Ok(InsertOutcome::Conflict),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn count_local_statuses(&self) -> Result<i64, AppError> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM statuses s
            JOIN actors a ON a.id = s.actor_id
            WHERE a.actor_type = 'LocalPerson'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    // =========================================================================
    // Relationship operations
    // =========================================================================

    /// Create or update the follower -> followee edge
    pub async fn set_following(
        &self,
        actor_id: &str,
        target_id: &str,
        following: bool,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO relationships (id, actor_id, target_id, following, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (actor_id, target_id)
            DO UPDATE SET following = excluded.following, updated_at = excluded.updated_at
            "#,
        )
        .bind(EntityId::new().0)
        .bind(actor_id)
        .bind(target_id)
        .bind(following)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_relationship(
        &self,
        actor_id: &str,
        target_id: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let relationship = sqlx::query_as::<_, Relationship>(
            "SELECT * FROM relationships WHERE actor_id = ? AND target_id = ?",
        )
        .bind(actor_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relationship)
    }

    /// URIs of actors following `actor_id`, oldest first
    pub async fn follower_uris(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        let uris = sqlx::query_scalar::<_, String>(
            r#"
            SELECT a.uri FROM relationships r
            JOIN actors a ON a.id = r.actor_id
            WHERE r.target_id = ? AND r.following = 1
            ORDER BY r.created_at ASC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(uris)
    }

    /// URIs of actors `actor_id` follows, oldest first
    pub async fn following_uris(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        let uris = sqlx::query_scalar::<_, String>(
            r#"
            SELECT a.uri FROM relationships r
            JOIN actors a ON a.id = r.target_id
            WHERE r.actor_id = ? AND r.following = 1
            ORDER BY r.created_at ASC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(uris)
    }

    // =========================================================================
    // Inbox operations
    // =========================================================================

    /// Append a raw inbound activity, returning its arrival id
    pub async fn insert_activity(&self, activity: &NewInboxActivity) -> Result<i64, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (activity_type, actor_uri, key_id, object_json, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.activity_type)
        .bind(&activity.actor_uri)
        .bind(&activity.key_id)
        .bind(&activity.object_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent activities in arrival order
    pub async fn list_activities(&self, limit: i64) -> Result<Vec<InboxActivity>, AppError> {
        let activities = sqlx::query_as::<_, InboxActivity>(
            r#"
            SELECT * FROM (SELECT * FROM inbox ORDER BY id DESC LIMIT ?)
            ORDER BY id ASC
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(activities)
    }

    pub async fn count_activities(&self) -> Result<i64, AppError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inbox")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }

    // =========================================================================
    // Dead-letter operations
    // =========================================================================

    pub async fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, inbox, activity_id, activity_json, attempts, last_error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&letter.id)
        .bind(&letter.inbox)
        .bind(&letter.activity_id)
        .bind(&letter.activity_json)
        .bind(letter.attempts)
        .bind(&letter.last_error)
        .bind(letter.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, AppError> {
        let letters = sqlx::query_as::<_, DeadLetter>(
            "SELECT * FROM dead_letters ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(letters)
    }
}
