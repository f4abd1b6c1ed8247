//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Kind of actor, as declared by its ActivityStreams `type`.
///
/// `LocalPerson` marks actors backed by a local [`Account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorType {
    Person,
    Application,
    Service,
    Group,
    Organization,
    LocalPerson,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "Person",
            Self::Application => "Application",
            Self::Service => "Service",
            Self::Group => "Group",
            Self::Organization => "Organization",
            Self::LocalPerson => "LocalPerson",
        }
    }

    /// Map a remote document `type`. Unknown types are treated as `Person`.
    pub fn from_remote(value: &str) -> Self {
        match value {
            "Application" => Self::Application,
            "Service" => Self::Service,
            "Group" => Self::Group,
            "Organization" => Self::Organization,
            _ => Self::Person,
        }
    }
}

/// A local or remote identity.
///
/// `uri` is the deduplication key; `(name, domain)` is unique as well.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// One of the [`ActorType`] names
    pub actor_type: String,
    /// ActivityPub id (globally unique)
    pub uri: String,
    /// preferredUsername
    pub name: String,
    /// Authority the actor document was served from
    pub domain: String,
    pub display_name: String,
    /// manuallyApprovesFollowers
    pub locked: bool,
    /// Sanitised HTML bio
    pub note: String,
    pub avatar: Option<String>,
    pub header: Option<String>,
    /// Declared inbox; `None` for local actors, whose inbox is derived
    pub inbox: Option<String>,
    pub public_key_pem: String,
    pub followers_count: i64,
    pub following_count: i64,
    pub statuses_count: i64,
    pub last_status_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// New actor with empty profile fields and zeroed counters
    pub fn new(
        actor_type: ActorType,
        uri: impl Into<String>,
        name: impl Into<String>,
        domain: impl Into<String>,
        public_key_pem: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            actor_type: actor_type.as_str().to_string(),
            uri: uri.into(),
            name: name.into(),
            domain: domain.into(),
            display_name: String::new(),
            locked: false,
            note: String::new(),
            avatar: None,
            header: None,
            inbox: None,
            public_key_pem: public_key_pem.into(),
            followers_count: 0,
            following_count: 0,
            statuses_count: 0,
            last_status_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_local(&self) -> bool {
        self.actor_type == ActorType::LocalPerson.as_str()
    }

    /// Inbox to deliver to, if one is known.
    pub fn inbox_url(&self) -> Option<String> {
        match &self.inbox {
            Some(inbox) if !inbox.trim().is_empty() => Some(inbox.clone()),
            _ if self.is_local() => Some(format!("{}/inbox", self.uri)),
            _ => None,
        }
    }

    /// keyId advertised for this actor's public key
    pub fn public_key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }

    /// `name@domain`
    pub fn acct(&self) -> String {
        format!("{}@{}", self.name, self.domain)
    }
}

// =============================================================================
// Account (local actors only)
// =============================================================================

/// Local extension of an [`Actor`], keyed by the actor id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub actor_id: String,
    pub email: Option<String>,
    /// RSA private key (PKCS#8 PEM)
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// A local account together with its public actor row.
#[derive(Debug, Clone)]
pub struct LocalAccount {
    pub actor: Actor,
    pub account: Account,
}

impl LocalAccount {
    /// Key material used to sign requests on behalf of this account.
    pub fn signing_identity(&self) -> SigningIdentity {
        SigningIdentity {
            key_id: self.actor.public_key_id(),
            private_key_pem: self.account.private_key_pem.clone(),
        }
    }
}

/// keyId plus the private key it names.
#[derive(Clone)]
pub struct SigningIdentity {
    pub key_id: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Status
// =============================================================================

/// A federated post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    /// Owning actor id
    pub actor_id: String,
    /// URI of the post this replies to
    pub in_reply_to_uri: Option<String>,
    /// Local id of the parent, set only when the parent was resolved
    pub in_reply_to_id: Option<String>,
    /// Sanitised HTML content
    pub content: String,
    /// Content warning text
    pub content_warning: Option<String>,
    pub sensitive: bool,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relationship
// =============================================================================

/// Follower -> followee edge
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relationship {
    pub id: String,
    /// Follower actor id
    pub actor_id: String,
    /// Followee actor id
    pub target_id: String,
    pub following: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Inbound activities
// =============================================================================

/// Raw inbound activity, stored exactly as received.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboxActivity {
    /// Arrival order
    pub id: i64,
    pub activity_type: Option<String>,
    pub actor_uri: Option<String>,
    /// keyId of the verified signature
    pub key_id: String,
    /// Verbatim request body
    pub object_json: String,
    pub received_at: DateTime<Utc>,
}

/// Fields recorded for a newly received activity.
#[derive(Debug, Clone)]
pub struct NewInboxActivity {
    pub activity_type: Option<String>,
    pub actor_uri: Option<String>,
    pub key_id: String,
    pub object_json: String,
}

// =============================================================================
// Dead letters
// =============================================================================

/// A delivery that will not be retried.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: String,
    pub inbox: String,
    pub activity_id: Option<String>,
    pub activity_json: String,
    pub attempts: i64,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Insert outcomes
// =============================================================================

/// Result of an insert guarded by unique indexes.
#[derive(Debug)]
pub enum InsertOutcome<T> {
    Inserted(T),
    /// A row with a colliding unique key already exists
    Conflict,
}
