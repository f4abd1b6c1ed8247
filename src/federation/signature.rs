//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests sign `(request-target) host date [digest]`. Inbound
//! requests are checked in two phases: everything that needs no network
//! (header syntax, signed header set, date skew, body digest) runs before the
//! public key is looked up, so garbage requests never trigger a key fetch.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Default tolerance between the signed Date header and the local clock
pub const DEFAULT_MAX_SKEW_SECS: i64 = 300;

/// Resolves a signature keyId to the PEM of the public key it names.
#[async_trait]
pub trait PublicKeyLookup: Send + Sync {
    async fn public_key_pem(
        &self,
        key_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AppError>;
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// keyId whose public key verified the request
    pub key_id: String,
}

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Errors
/// `Signing` if the key is absent or unparseable, `Validation` for a bad URL.
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/users/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(method, url, body, private_key_pem, key_id, Utc::now())
}

pub(crate) fn sign_request_at(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    if private_key_pem.trim().is_empty() {
        return Err(AppError::Signing("private key is missing".to_string()));
    }

    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = host_header_value(&parsed_url)?;
    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let date = http_date(now);
    let digest = body.map(generate_digest);

    let mut signing_parts = vec![
        format!("(request-target): {} {}", method.to_lowercase(), path_and_query),
        format!("host: {}", host),
        format!("date: {}", date),
    ];
    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let private_key = parse_private_key(private_key_pem)?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// `host[:port]` exactly as an HTTP client sends it in the Host header.
///
/// The port is kept whenever it differs from the scheme default.
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Signing(format!("Invalid private key: {}", e)))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::SignatureInvalid(format!("Invalid public key: {}", e)))
}

/// Verify an inbound HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path including the query string
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `lookup` - Resolves the keyId to a public key
/// * `max_skew_secs` - Allowed distance between Date and now
///
/// # Errors
/// - `SignatureInvalid` for malformed headers, digest mismatch, stale date or
///   a bad signature
/// - `KeyLookup` / `Cancelled` as returned by `lookup`
pub async fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    lookup: &dyn PublicKeyLookup,
    max_skew_secs: i64,
    cancel: &CancellationToken,
) -> Result<VerifiedSignature, AppError> {
    let prepared = prepare_verification(method, path, headers, body, max_skew_secs, Utc::now())?;

    let public_key_pem = lookup.public_key_pem(&prepared.key_id, cancel).await?;

    verify_prepared(&prepared, &public_key_pem)?;

    Ok(VerifiedSignature {
        key_id: prepared.key_id,
    })
}

/// Signature header checked and signing string rebuilt, key not yet consulted.
#[derive(Debug)]
struct PreparedVerification {
    key_id: String,
    signature: String,
    signing_string: String,
}

fn prepare_verification(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    max_skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<PreparedVerification, AppError> {
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    let algorithm = parsed.algorithm.as_deref().unwrap_or("hs2019");
    if !algorithm.eq_ignore_ascii_case("rsa-sha256") && !algorithm.eq_ignore_ascii_case("hs2019")
    {
        return Err(AppError::SignatureInvalid(format!(
            "Unsupported signature algorithm: {}",
            algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::SignatureInvalid(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    let has_body = body.is_some_and(|b| !b.is_empty());
    if has_body && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::SignatureInvalid(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::SignatureInvalid("Invalid Date format".to_string()))?;
    if (now.timestamp() - date.timestamp()).abs() > max_skew_secs {
        return Err(AppError::SignatureInvalid(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body_data) = body.filter(|b| !b.is_empty()) {
        let digest_header = header_str(headers, "digest")?;
        if !digest_matches(digest_header, body_data) {
            return Err(AppError::SignatureInvalid("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name => header_str(headers, name)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok(PreparedVerification {
        key_id: parsed.key_id,
        signature: parsed.signature,
        signing_string: signing_parts.join("\n"),
    })
}

fn verify_prepared(prepared: &PreparedVerification, public_key_pem: &str) -> Result<(), AppError> {
    let signature_bytes = BASE64
        .decode(&prepared.signature)
        .map_err(|_| AppError::SignatureInvalid("Invalid signature encoding".to_string()))?;

    let public_key = parse_public_key(public_key_pem)?;
    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::SignatureInvalid(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(prepared.signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::SignatureInvalid("Signature verification failed".to_string()))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::SignatureInvalid(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::SignatureInvalid(format!("Invalid {} header", name)))
}

/// Digest headers may list several algorithms; only SHA-256 is checked.
fn digest_matches(digest_header: &str, body: &[u8]) -> bool {
    let expected = generate_digest(body);
    let expected_value = &expected["SHA-256=".len()..];

    digest_header.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .is_some_and(|(algorithm, value)| {
                algorithm.eq_ignore_ascii_case("sha-256") && value == expected_value
            })
    })
}

/// Owner of a keyId: the keyId without its fragment.
pub fn key_owner_uri(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    key_owner_uri(key_id) == key_owner_uri(actor_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm; absent means hs2019
    pub algorithm: Option<String>,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .filter(|k: &String| !k.is_empty())
            .ok_or_else(|| AppError::SignatureInvalid("Missing keyId".to_string()))?,
        algorithm,
        // Without an explicit list only Date is signed, which is never enough here
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::SignatureInvalid("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::test_support::generate_test_keypair;
    use http::{HeaderMap, HeaderValue};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY_ID: &str = "https://remote.example/users/alice#main-key";

    /// keyId -> PEM table that counts lookups
    #[derive(Default)]
    struct StaticKeys {
        keys: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl StaticKeys {
        fn with(key_id: &str, pem: &str) -> Self {
            let mut keys = HashMap::new();
            keys.insert(key_id.to_string(), pem.to_string());
            Self {
                keys,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PublicKeyLookup for StaticKeys {
        async fn public_key_pem(
            &self,
            key_id: &str,
            _cancel: &CancellationToken,
        ) -> Result<String, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.keys
                .get(key_id)
                .cloned()
                .ok_or_else(|| AppError::KeyLookup {
                    key_id: key_id.to_string(),
                    reason: "unknown key".to_string(),
                })
        }
    }

    fn signed_headers_at(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
        now: DateTime<Utc>,
    ) -> (HeaderMap, String) {
        let signed =
            sign_request_at(method, url, body, private_key_pem, KEY_ID, now).expect("signed");
        let parsed_url = url::Url::parse(url).expect("valid test url");
        let host = host_header_value(&parsed_url).expect("host");
        let path_and_query = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&host).expect("host header"));
        headers.insert(
            "date",
            HeaderValue::from_str(&signed.date).expect("date header"),
        );
        if let Some(digest) = signed.digest {
            headers.insert(
                "digest",
                HeaderValue::from_str(&digest).expect("digest header"),
            );
        }
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature header"),
        );

        (headers, path_and_query)
    }

    fn signed_headers(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
    ) -> (HeaderMap, String) {
        signed_headers_at(method, url, body, private_key_pem, Utc::now())
    }

    async fn verify(
        path: &str,
        headers: &HeaderMap,
        body: Option<&[u8]>,
        keys: &StaticKeys,
    ) -> Result<VerifiedSignature, AppError> {
        verify_request(
            "POST",
            path,
            headers,
            body,
            keys,
            DEFAULT_MAX_SKEW_SECS,
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn verify_request_accepts_valid_signed_request() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(body),
            &private_key_pem,
        );

        let verified = verify(&path, &headers, Some(body), &keys)
            .await
            .expect("valid signature should verify");
        assert_eq!(verified.key_id, KEY_ID);
        assert_eq!(keys.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verify_request_rejects_flipped_body_byte() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#.to_vec();
        let (headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(&body),
            &private_key_pem,
        );

        for index in 0..body.len() {
            let mut tampered = body.clone();
            tampered[index] ^= 0x01;
            match verify(&path, &headers, Some(&tampered), &keys).await {
                Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("Digest mismatch")),
                other => panic!("byte {index}: expected digest mismatch, got: {other:?}"),
            }
        }
        // Cheap checks fail before any key lookup
        assert_eq!(keys.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn verify_request_rejects_body_with_recomputed_digest() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let forged = br#"{"type":"Block"}"#;
        headers.insert(
            "digest",
            HeaderValue::from_str(&generate_digest(forged)).unwrap(),
        );

        match verify(&path, &headers, Some(forged), &keys).await {
            Err(AppError::SignatureInvalid(msg)) => {
                assert!(msg.contains("Signature verification failed"))
            }
            other => panic!("expected signature failure, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_request_rejects_tampered_signed_header() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );
        headers.insert("host", HeaderValue::from_static("evil.example"));

        assert!(matches!(
            verify(&path, &headers, Some(body), &keys).await,
            Err(AppError::SignatureInvalid(_))
        ));

        // A different path is a different request target
        let (headers, _) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );
        assert!(matches!(
            verify("/users/alice/inbox", &headers, Some(body), &keys).await,
            Err(AppError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn verify_request_rejects_missing_date_header() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );
        headers.remove("date");

        match verify(&path, &headers, Some(body), &keys).await {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("Missing date header")),
            other => panic!("expected missing Date header error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_request_rejects_missing_digest_header_for_body() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );
        headers.remove("digest");

        match verify(&path, &headers, Some(body), &keys).await {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("Missing digest header")),
            other => panic!("expected missing Digest header error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_request_rejects_when_date_not_in_signed_headers() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let parsed =
            parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host digest\",signature=\"{}\"",
            parsed.key_id, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        match verify(&path, &headers, Some(body), &keys).await {
            Err(AppError::SignatureInvalid(msg)) => {
                assert!(msg.contains("Signed headers must include: date"))
            }
            other => panic!("expected missing signed date error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_request_rejects_stale_date() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let body = br#"{"type":"Follow"}"#;
        let stale = Utc::now() - chrono::Duration::seconds(DEFAULT_MAX_SKEW_SECS + 60);
        let (headers, path) = signed_headers_at(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            stale,
        );

        match verify(&path, &headers, Some(body), &keys).await {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("too old")),
            other => panic!("expected stale date error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_request_rejects_wrong_key() {
        let (private_key_pem, _) = generate_test_keypair();
        let (_, other_public_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &other_public_pem);
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        assert!(matches!(
            verify(&path, &headers, Some(body), &keys).await,
            Err(AppError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn verify_request_surfaces_key_lookup_failure() {
        let (private_key_pem, _) = generate_test_keypair();
        let keys = StaticKeys::default();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        match verify(&path, &headers, Some(body), &keys).await {
            Err(AppError::KeyLookup { key_id, .. }) => assert_eq!(key_id, KEY_ID),
            other => panic!("expected key lookup error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_request_rejects_unknown_algorithm() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let keys = StaticKeys::with(KEY_ID, &public_key_pem);
        let (mut headers, path) = signed_headers(
            "POST",
            "https://remote.example/inbox",
            None,
            &private_key_pem,
        );
        let parsed =
            parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"hmac-sha256\",headers=\"(request-target) host date\",signature=\"{}\"",
            parsed.key_id, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        match verify(&path, &headers, None, &keys).await {
            Err(AppError::SignatureInvalid(msg)) => assert!(msg.contains("Unsupported")),
            other => panic!("expected unsupported algorithm, got: {other:?}"),
        }
    }

    #[test]
    fn sign_request_keeps_non_default_port_in_host() {
        let (private_key_pem, _) = generate_test_keypair();
        let url = url::Url::parse("http://127.0.0.1:8080/inbox").unwrap();
        assert_eq!(host_header_value(&url).unwrap(), "127.0.0.1:8080");

        let url = url::Url::parse("https://remote.example:443/inbox").unwrap();
        assert_eq!(host_header_value(&url).unwrap(), "remote.example");

        assert!(
            sign_request(
                "GET",
                "http://127.0.0.1:8080/users/alice",
                None,
                &private_key_pem,
                KEY_ID
            )
            .is_ok()
        );
    }

    #[test]
    fn sign_request_rejects_missing_or_malformed_key() {
        assert!(matches!(
            sign_request("GET", "https://remote.example/", None, "", KEY_ID),
            Err(AppError::Signing(_))
        ));
        assert!(matches!(
            sign_request("GET", "https://remote.example/", None, "not a pem", KEY_ID),
            Err(AppError::Signing(_))
        ));
    }

    #[test]
    fn digest_matches_accepts_multiple_algorithms() {
        let body = b"hello";
        let header = format!("MD5=abc, {}", generate_digest(body).replace("SHA-256", "sha-256"));
        assert!(digest_matches(&header, body));
        assert!(!digest_matches("SHA-256=AAAA", body));
    }

    #[test]
    fn parse_signature_header_reads_fields() {
        let parsed = parse_signature_header(
            "keyId=\"https://remote.example/users/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) Host date\",signature=\"ZmFrZQ==\"",
        )
        .expect("header should parse");
        assert_eq!(parsed.key_id, KEY_ID);
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(parsed.signature, "ZmFrZQ==");
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert_eq!(
            key_owner_uri("https://remote.example/users/alice#main-key"),
            "https://remote.example/users/alice"
        );
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
