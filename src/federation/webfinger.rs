//! WebFinger protocol implementation
//!
//! Parses `acct:` resources and builds JRD documents for local actors.

use serde::{Deserialize, Serialize};

use crate::data::Actor;
use crate::error::AppError;

pub const SUBSCRIBE_REL: &str = "http://ostatus.org/schema/1.0/subscribe";

/// `user@host` part of an `acct:` resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acct {
    pub user: String,
    pub host: String,
}

impl Acct {
    /// Parse `user@host`, tolerating a leading `@`.
    pub fn parse(address: &str) -> Result<Self, AppError> {
        let address = address.strip_prefix('@').unwrap_or(address);
        match address.split_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => {
                Ok(Self {
                    user: user.to_string(),
                    host: host.to_string(),
                })
            }
            _ => Err(AppError::Validation(format!(
                "invalid account address {:?}",
                address
            ))),
        }
    }
}

impl std::fmt::Display for Acct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Parse a WebFinger `resource` query value.
///
/// Only `acct:user@host` is accepted; anything else is a `Validation` error.
pub fn parse_resource(resource: &str) -> Result<Acct, AppError> {
    let parts: Vec<&str> = resource.split(':').collect();
    match parts.as_slice() {
        ["acct", address] => Acct::parse(address),
        _ => Err(AppError::Validation(format!(
            "invalid resource {:?}",
            resource
        ))),
    }
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerResponse {
    /// `self` link href, if any
    pub fn actor_uri(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == "self")
            .and_then(|link| link.href.as_deref())
    }
}

/// Generate the JRD for a local actor.
///
/// # Arguments
/// * `actor` - Local actor
/// * `base_url` - Instance base URL (includes protocol)
pub fn generate_webfinger_response(actor: &Actor, base_url: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", actor.name, actor.domain),
        aliases: Some(vec![actor.uri.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor.uri.clone()),
                template: None,
            },
            WebFingerLink {
                rel: SUBSCRIBE_REL.to_string(),
                link_type: None,
                href: None,
                template: Some(format!(
                    "{}/authorize_interaction?uri={{uri}}",
                    base_url.trim_end_matches('/')
                )),
            },
        ],
    }
}
