//! Signed outbound HTTP
//!
//! Every request is signed with the caller's [`SigningIdentity`], bounded by
//! the configured timeout, and abandoned as soon as the caller's
//! cancellation token fires. Nothing here retries; the delivery queue owns
//! retry policy.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::Value;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::signature::sign_request;
use crate::config::FederationConfig;
use crate::data::SigningIdentity;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const ACTIVITY_JSON: &str = "application/activity+json";
const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
const MAX_DOCUMENT_BYTES: usize = 2 * 1024 * 1024;
const MAX_REDIRECTS: usize = 5;

/// A remote JSON document and the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Final URL after redirects
    pub url: String,
    pub body: Value,
}

/// Signed GET/POST against remote servers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch an ActivityStreams document.
    async fn get(
        &self,
        uri: &str,
        identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, AppError>;

    /// Deliver an activity to an inbox.
    async fn post(
        &self,
        uri: &str,
        payload: &Value,
        identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<(), AppError>;
}

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: String,
    allow_private_addresses: bool,
}

impl HttpTransport {
    pub fn new(config: &FederationConfig, base_url: &str) -> Result<Self, AppError> {
        let allow_private = config.allow_private_addresses;
        let redirect_policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            let refused = !allow_private
                && attempt
                    .url()
                    .host_str()
                    .map(is_disallowed_host)
                    .unwrap_or(true);
            if refused {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout().min(Duration::from_secs(5)))
            .redirect(redirect_policy)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            user_agent: format!("rustpub/{} (+{})", env!("CARGO_PKG_VERSION"), base_url),
            allow_private_addresses: allow_private,
        })
    }

    /// Reject destinations that are not public HTTP(S) endpoints.
    async fn check_destination(&self, uri: &str) -> Result<url::Url, AppError> {
        let url = check_url_syntax(uri, self.allow_private_addresses)?;

        if !self.allow_private_addresses {
            let host = url
                .host_str()
                .ok_or_else(|| AppError::Validation(format!("Missing host in URL: {}", uri)))?;
            let port = url
                .port_or_known_default()
                .ok_or_else(|| AppError::Validation(format!("Missing port in URL: {}", uri)))?;
            validate_resolved_host_ips(uri, host, port).await?;
        }

        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        uri: &str,
        identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<FetchedDocument, AppError> {
        let url = self.check_destination(uri).await?;
        let signed = sign_request(
            "GET",
            url.as_str(),
            None,
            &identity.private_key_pem,
            &identity.key_id,
        )?;

        let request = self
            .client
            .get(url)
            .header(ACCEPT, ACCEPT_ACTIVITY)
            .header(USER_AGENT, &self.user_agent)
            .header("Date", &signed.date)
            .header("Signature", &signed.signature);

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            result = request.send() => result,
        };
        let response = finish_request("GET", uri, response, started)?;

        let final_url = response.url().to_string();
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Delivery {
                uri: uri.to_string(),
                status: Some(status.as_u16()),
                reason: format!("GET returned {}", status),
            });
        }

        let bytes = read_capped(response, uri, cancel).await?;

        let body: Value = serde_json::from_slice(&bytes).map_err(|e| AppError::RemoteFetch {
            uri: uri.to_string(),
            reason: format!("invalid JSON: {}", e),
        })?;

        Ok(FetchedDocument {
            url: final_url,
            body,
        })
    }

    async fn post(
        &self,
        uri: &str,
        payload: &Value,
        identity: &SigningIdentity,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let url = self.check_destination(uri).await?;
        let body = serde_json::to_vec(payload).map_err(|e| AppError::Internal(e.into()))?;
        let signed = sign_request(
            "POST",
            url.as_str(),
            Some(&body),
            &identity.private_key_pem,
            &identity.key_id,
        )?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, ACTIVITY_JSON)
            .header(ACCEPT, ACTIVITY_JSON)
            .header(USER_AGENT, &self.user_agent)
            .header("Date", &signed.date)
            .header("Signature", &signed.signature);
        if let Some(digest) = &signed.digest {
            request = request.header("Digest", digest);
        }

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            result = request.body(body).send() => result,
        };
        let response = finish_request("POST", uri, response, started)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        Err(AppError::Delivery {
            uri: uri.to_string(),
            status: Some(status.as_u16()),
            reason: truncate(&detail, 200),
        })
    }
}

/// Record metrics for a completed round trip and map transport failures.
fn finish_request(
    method: &str,
    uri: &str,
    result: Result<reqwest::Response, reqwest::Error>,
    started: Instant,
) -> Result<reqwest::Response, AppError> {
    FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&[method])
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&[method, response.status().as_str()])
                .inc();
            tracing::debug!(
                method,
                uri,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Federation request completed"
            );
            Ok(response)
        }
        Err(error) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&[method, "error"])
                .inc();
            tracing::debug!(method, uri, %error, "Federation request failed");
            Err(network_error(uri, &error))
        }
    }
}

fn network_error(uri: &str, error: &reqwest::Error) -> AppError {
    let reason = if error.is_timeout() {
        "request timed out".to_string()
    } else {
        error.to_string()
    };
    AppError::Delivery {
        uri: uri.to_string(),
        status: error.status().map(|s| s.as_u16()),
        reason,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

// =============================================================================
// Destination checks
// =============================================================================

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Scheme and literal-host checks that need no DNS.
fn check_url_syntax(uri: &str, allow_private_addresses: bool) -> Result<url::Url, AppError> {
    let url =
        url::Url::parse(uri).map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", uri, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("Missing host in URL: {}", uri)))?;

    if !allow_private_addresses && is_disallowed_host(host) {
        return Err(AppError::Forbidden(format!(
            "refusing request to local address {}",
            host
        )));
    }

    Ok(url)
}

/// Resolve DNS before connecting and reject local/private destinations.
async fn validate_resolved_host_ips(uri: &str, host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Delivery {
            uri: uri.to_string(),
            status: None,
            reason: format!("failed to resolve host: {}", e),
        })?;

    let mut resolved_any = false;
    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden(format!(
                "{} resolves to a local address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Delivery {
            uri: uri.to_string(),
            status: None,
            reason: "no DNS records for host".to_string(),
        });
    }

    Ok(())
}

/// Read a response body, giving up as soon as it passes `MAX_DOCUMENT_BYTES`.
async fn read_capped(
    mut response: reqwest::Response,
    uri: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, AppError> {
    let too_large = || AppError::RemoteFetch {
        uri: uri.to_string(),
        reason: format!("document exceeds {} bytes", MAX_DOCUMENT_BYTES),
    };

    if response
        .content_length()
        .is_some_and(|len| len > MAX_DOCUMENT_BYTES as u64)
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            chunk = response.chunk() => chunk.map_err(|e| network_error(uri, &e))?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        if body.len() + chunk.len() > MAX_DOCUMENT_BYTES {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}
