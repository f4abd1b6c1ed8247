//! Outbound activity construction
//!
//! Pure functions from (verb, acting actor, target) to an ActivityStreams
//! document. Only the generated ids vary between calls with the same input.

use serde_json::Value;

use crate::data::EntityId;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Outbound verbs supported by the delivery service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Follow,
    Unfollow,
    Like,
    Unlike,
}

impl Verb {
    /// ActivityStreams `type` of the top-level activity
    pub fn activity_type(&self) -> &'static str {
        match self {
            Verb::Follow => "Follow",
            Verb::Like => "Like",
            Verb::Unfollow | Verb::Unlike => "Undo",
        }
    }

    /// The verb an Undo reverses
    pub fn undone(&self) -> Option<Verb> {
        match self {
            Verb::Unfollow => Some(Verb::Follow),
            Verb::Unlike => Some(Verb::Like),
            Verb::Follow | Verb::Like => None,
        }
    }

    fn id_segment(&self) -> &'static str {
        match self {
            Verb::Follow => "follow",
            Verb::Like => "like",
            Verb::Unfollow | Verb::Unlike => "undo",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verb::Follow => "follow",
            Verb::Unfollow => "unfollow",
            Verb::Like => "like",
            Verb::Unlike => "unlike",
        };
        f.write_str(name)
    }
}

/// Fresh activity id under the acting actor, e.g. `{actor}/follow/{ulid}`
pub fn activity_id(actor_uri: &str, verb: Verb) -> String {
    format!("{}/{}/{}", actor_uri, verb.id_segment(), EntityId::new().0)
}

/// Build the activity for `verb` with a freshly generated id.
pub fn build_activity(verb: Verb, actor_uri: &str, target_uri: &str) -> Value {
    build_activity_with_id(&activity_id(actor_uri, verb), verb, actor_uri, target_uri, None)
}

/// Build the activity for `verb` with an explicit id.
///
/// For Undo verbs `undone_id` is the id of the original Follow or Like when
/// the caller still knows it; it is omitted from the embedded object otherwise.
pub fn build_activity_with_id(
    id: &str,
    verb: Verb,
    actor_uri: &str,
    target_uri: &str,
    undone_id: Option<&str>,
) -> Value {
    match verb.undone() {
        None => builder::simple(id, verb.activity_type(), actor_uri, target_uri),
        Some(inner) => builder::undo(
            id,
            actor_uri,
            builder::embedded(undone_id, inner.activity_type(), actor_uri, target_uri),
        ),
    }
}

pub mod builder {
    use super::ACTIVITYSTREAMS_CONTEXT;
    use serde_json::{Map, Value, json};

    /// Build an activity whose object is a plain URI (Follow, Like)
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `kind` - ActivityStreams type
    /// * `actor` - Actor URI
    /// * `object` - Target URI
    pub fn simple(id: &str, kind: &str, actor: &str, object: &str) -> Value {
        json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "type": kind,
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Description of the activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        json!({
            "@context": ACTIVITYSTREAMS_CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Embedded description of an earlier activity.
    pub fn embedded(id: Option<&str>, kind: &str, actor: &str, object: &str) -> Value {
        let mut embedded = Map::new();
        if let Some(id) = id {
            embedded.insert("id".to_string(), json!(id));
        }
        embedded.insert("type".to_string(), json!(kind));
        embedded.insert("actor".to_string(), json!(actor));
        embedded.insert("object".to_string(), json!(object));
        Value::Object(embedded)
    }
}
