//! Decoding of remote ActivityStreams JSON
//!
//! Remote servers disagree on shapes: a reference may be a bare URI, an
//! object with an `id`, or an array of either. The lenient helpers here
//! accept all three and always pick the first usable entry.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::data::{Actor, ActorType};
use crate::error::AppError;

/// First id found in a string, `{ "id": ... }` object, or array of either.
pub fn first_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(first_id),
        Value::Array(items) => items.iter().find_map(first_id),
        _ => None,
    }
}

/// First URL found in a string, Image/Link object, or array of either.
fn first_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("href"))
            .and_then(first_url),
        Value::Array(items) => items.iter().find_map(first_url),
        _ => None,
    }
}

/// Strip markup that is unsafe to re-serve.
pub fn sanitize_html(html: &str) -> String {
    ammonia::clean(html)
}

/// `host[:port]` of a URL; the port is omitted when it is the scheme default.
pub fn authority_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

// =============================================================================
// Actor documents
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub manually_approves_followers: Option<bool>,
    pub inbox: Option<String>,
    pub endpoints: Option<Endpoints>,
    pub icon: Option<Value>,
    pub image: Option<Value>,
    pub public_key: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    pub shared_inbox: Option<String>,
}

impl ActorDocument {
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    fn kind_name(&self) -> Option<&str> {
        match self.kind.as_ref()? {
            Value::String(s) => Some(s.as_str()),
            Value::Array(items) => items.iter().find_map(Value::as_str),
            _ => None,
        }
    }

    /// publicKey may be a single object or an array of keys.
    pub fn public_key_pem(&self) -> Option<&str> {
        fn pem_of(key: &Value) -> Option<&str> {
            key.get("publicKeyPem").and_then(Value::as_str)
        }

        let pem = match self.public_key.as_ref()? {
            Value::Array(keys) => keys.iter().find_map(pem_of),
            key => pem_of(key),
        };
        pem.filter(|pem| !pem.trim().is_empty())
    }

    /// Build an unsaved [`Actor`] for the document served at `requested_uri`.
    ///
    /// `domain` is the authority of the URL the document was served from.
    pub fn to_actor(&self, requested_uri: &str, domain: &str) -> Result<Actor, AppError> {
        let malformed = |reason: &str| AppError::MalformedActor {
            uri: requested_uri.to_string(),
            reason: reason.to_string(),
        };

        let id = self.id.as_deref().ok_or_else(|| malformed("missing id"))?;
        if id != requested_uri {
            return Err(malformed(&format!("document id {} does not match", id)));
        }
        let name = self
            .preferred_username
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| malformed("missing preferredUsername"))?;
        let public_key_pem = self
            .public_key_pem()
            .ok_or_else(|| malformed("missing publicKey.publicKeyPem"))?;

        let actor_type = self
            .kind_name()
            .map(ActorType::from_remote)
            .unwrap_or(ActorType::Person);

        let mut actor = Actor::new(actor_type, id, name, domain, public_key_pem);
        actor.display_name = self.name.clone().unwrap_or_default();
        actor.locked = self.manually_approves_followers.unwrap_or(false);
        actor.note = self
            .summary
            .as_deref()
            .map(sanitize_html)
            .unwrap_or_default();
        actor.avatar = self.icon.as_ref().and_then(first_url);
        actor.header = self.image.as_ref().and_then(first_url);
        actor.inbox = self
            .inbox
            .clone()
            .or_else(|| self.endpoints.as_ref()?.shared_inbox.clone())
            .filter(|inbox| !inbox.trim().is_empty());

        Ok(actor)
    }
}

// =============================================================================
// Object documents (statuses)
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDocument {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub attributed_to: Option<Value>,
    pub in_reply_to: Option<Value>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub sensitive: Option<bool>,
    pub published: Option<String>,
}

impl ObjectDocument {
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }

    pub fn owner_uri(&self) -> Option<String> {
        self.attributed_to.as_ref().and_then(first_id)
    }

    pub fn in_reply_to_uri(&self) -> Option<String> {
        self.in_reply_to.as_ref().and_then(first_id)
    }

    /// Publication time, or now when absent or unparseable.
    pub fn published_at(&self) -> DateTime<Utc> {
        self.published
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }
}

// =============================================================================
// Inbound activities
// =============================================================================

/// Activity types the inbox recognises. Anything else is kept as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Block,
    Move,
    Add,
    Remove,
    Flag,
    Other(String),
}

impl ActivityKind {
    pub fn parse(value: &str) -> Self {
        match value {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Block" => Self::Block,
            "Move" => Self::Move,
            "Add" => Self::Add,
            "Remove" => Self::Remove,
            "Flag" => Self::Flag,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Move => "Move",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Flag => "Flag",
            Self::Other(other) => other,
        }
    }

    /// Label for metrics; unknown types collapse into one series.
    pub fn metric_label(&self) -> &str {
        match self {
            Self::Other(_) => "other",
            known => known.as_str(),
        }
    }
}

/// Envelope fields of an inbound activity.
#[derive(Debug, Clone)]
pub struct InboundActivity {
    pub id: Option<String>,
    pub kind: Option<ActivityKind>,
    pub actor_uri: Option<String>,
    pub object: Option<Value>,
}

impl InboundActivity {
    /// Decode a request body; it must be a JSON object.
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::MalformedActivity(format!("invalid JSON: {}", e)))?;
        let Value::Object(map) = value else {
            return Err(AppError::MalformedActivity(
                "activity must be a JSON object".to_string(),
            ));
        };

        let kind = match map.get("type") {
            Some(Value::String(s)) => Some(ActivityKind::parse(s)),
            Some(Value::Array(items)) => items.iter().find_map(Value::as_str).map(ActivityKind::parse),
            _ => None,
        };

        Ok(Self {
            id: map.get("id").and_then(Value::as_str).map(str::to_string),
            kind,
            actor_uri: map.get("actor").and_then(first_id),
            object: map.get("object").cloned(),
        })
    }
}
