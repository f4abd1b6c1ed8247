//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Signed transport (fetch and deliver)
//! - Actor and status resolution (find-or-create)
//! - Outbound activity building and delivery
//! - Inbox ingestion
//! - WebFinger

mod activity;
mod actor_resolver;
mod delivery;
mod document;
mod inbox;
mod queue;
mod signature;
mod status_resolver;
mod transport;
mod webfinger;

#[cfg(test)]
mod test_support;

pub use activity::{ACTIVITYSTREAMS_CONTEXT, Verb, activity_id, build_activity, build_activity_with_id};
pub use actor_resolver::ActorResolver;
pub use delivery::{DeliveryReceipt, DeliveryService};
pub use document::{ActivityKind, ActorDocument, InboundActivity, ObjectDocument, sanitize_html};
pub use inbox::{InboxOutcome, InboxProcessor};
pub use queue::{DeliveryJob, DeliveryQueue};
pub use signature::{
    DEFAULT_MAX_SKEW_SECS, PublicKeyLookup, SignatureHeaders, VerifiedSignature, generate_digest,
    key_id_matches_actor, parse_signature_header, sign_request, verify_request,
};
pub use status_resolver::StatusResolver;
pub use transport::{ACTIVITY_JSON, FetchedDocument, HttpTransport, Transport};
pub use webfinger::{Acct, WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_resource};
