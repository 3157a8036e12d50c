//! Authentication of ingest requests.
//!
//! Each node shares a secret with the server and signs every upload with
//! HMAC-SHA256 over `node_id "." timestamp "." nonce "." body`. The
//! [`Verifier`] bounds clock skew with a signature window and rejects
//! replays through the [`NonceCache`]. Callers only ever see the coarse
//! [`AuthError::public_reason`]; the precise failure goes to the log.

pub mod nonce;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub use nonce::NonceCache;

use crate::config::SecurityConfig;

type HmacSha256 = Hmac<Sha256>;

pub const NODE_HEADER: &str = "X-Node-Id";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const NONCE_HEADER: &str = "X-Nonce";
pub const SIGNATURE_HEADER: &str = "X-Signature";

const MAX_NONCE_LEN: usize = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("malformed header {0}")]
    MalformedHeader(&'static str),

    #[error("timestamp {timestamp} is more than {window}s from server time {now}")]
    StaleTimestamp { timestamp: i64, now: i64, window: i64 },

    #[error("nonce {nonce} already used by {node}")]
    Replay { node: String, nonce: String },

    #[error("no secret configured for node {0}")]
    UnknownNode(String),

    #[error("signature mismatch")]
    BadSignature,
}

impl AuthError {
    /// The only detail returned to the client.
    pub fn public_reason(&self) -> &'static str {
        match self {
            AuthError::MissingHeader(_) | AuthError::MalformedHeader(_) => {
                "missing or malformed signature headers"
            }
            _ => "invalid signature",
        }
    }
}

/// Anything headers can be looked up in, case-insensitively.
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl HeaderSource for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl HeaderSource for axum::http::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Identity established by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSender {
    pub node_id: String,
    pub timestamp: i64,
    pub nonce: String,
}

/// Per-node secrets and protocol windows, fixed at startup.
pub struct SecurityContext {
    secrets: HashMap<String, Zeroizing<Vec<u8>>>,
    sig_window_sec: i64,
    nonce_ttl_sec: u64,
}

impl SecurityContext {
    pub fn new<I, K, V>(secrets: I, sig_window_sec: u64, nonce_ttl_sec: u64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        Self {
            secrets: secrets
                .into_iter()
                .map(|(node, secret)| (node.into(), Zeroizing::new(secret.as_ref().to_vec())))
                .collect(),
            sig_window_sec: i64::try_from(sig_window_sec).unwrap_or(i64::MAX),
            nonce_ttl_sec,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.hmac_secrets.iter().map(|(k, v)| (k.clone(), v.as_bytes())),
            config.sig_window_sec,
            config.nonce_ttl_sec,
        )
    }

    pub fn secret(&self, node_id: &str) -> Option<&[u8]> {
        self.secrets.get(node_id).map(|s| s.as_slice())
    }

    pub fn node_count(&self) -> usize {
        self.secrets.len()
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<&String> = self.secrets.keys().collect();
        nodes.sort();
        f.debug_struct("SecurityContext")
            .field("nodes", &nodes)
            .field("sig_window_sec", &self.sig_window_sec)
            .field("nonce_ttl_sec", &self.nonce_ttl_sec)
            .finish()
    }
}

fn keyed_mac(
    secret: &[u8],
    node_id: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> Result<HmacSha256, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(node_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(nonce.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Hex signature a node attaches to an upload.
pub fn sign(
    secret: &[u8],
    node_id: &str,
    timestamp: i64,
    nonce: &str,
    body: &[u8],
) -> Result<String, hmac::digest::InvalidLength> {
    let mac = keyed_mac(secret, node_id, timestamp, nonce, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks signatures and owns the nonce store.
#[derive(Debug)]
pub struct Verifier {
    context: SecurityContext,
    nonces: NonceCache,
}

impl Verifier {
    pub fn new(context: SecurityContext) -> Self {
        Self {
            nonces: NonceCache::new(context.nonce_ttl_sec),
            context,
        }
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    /// Verify a request against the current server time.
    pub fn verify<H>(&self, headers: &H, body: &[u8]) -> Result<VerifiedSender, AuthError>
    where
        H: HeaderSource + ?Sized,
    {
        self.verify_at(headers, body, Utc::now().timestamp())
    }

    /// Verify a request as if the server clock read `now`.
    pub fn verify_at<H>(
        &self,
        headers: &H,
        body: &[u8],
        now: i64,
    ) -> Result<VerifiedSender, AuthError>
    where
        H: HeaderSource + ?Sized,
    {
        let result = self.check(headers, body, now);
        match &result {
            Ok(sender) => debug!(node = %sender.node_id, "ingest request authenticated"),
            Err(e) => warn!(
                node = headers.header(NODE_HEADER).unwrap_or("-"),
                error = %e,
                "ingest authentication failed"
            ),
        }
        result
    }

    fn check<H>(&self, headers: &H, body: &[u8], now: i64) -> Result<VerifiedSender, AuthError>
    where
        H: HeaderSource + ?Sized,
    {
        let node_id = required(headers, NODE_HEADER)?;
        let ts_raw = required(headers, TIMESTAMP_HEADER)?;
        let nonce = required(headers, NONCE_HEADER)?;
        let sig_hex = required(headers, SIGNATURE_HEADER)?;

        if node_id.contains('.') {
            return Err(AuthError::MalformedHeader(NODE_HEADER));
        }
        if nonce.contains('.') || nonce.len() > MAX_NONCE_LEN {
            return Err(AuthError::MalformedHeader(NONCE_HEADER));
        }
        let timestamp: i64 = ts_raw
            .parse()
            .map_err(|_| AuthError::MalformedHeader(TIMESTAMP_HEADER))?;
        let signature =
            hex::decode(sig_hex).map_err(|_| AuthError::MalformedHeader(SIGNATURE_HEADER))?;

        let window = self.context.sig_window_sec;
        if now.abs_diff(timestamp) > window.unsigned_abs() {
            return Err(AuthError::StaleTimestamp {
                timestamp,
                now,
                window,
            });
        }

        if !self.nonces.check_and_record(node_id, nonce, now) {
            return Err(AuthError::Replay {
                node: node_id.to_string(),
                nonce: nonce.to_string(),
            });
        }

        let secret = self
            .context
            .secret(node_id)
            .ok_or_else(|| AuthError::UnknownNode(node_id.to_string()))?;
        let mac = keyed_mac(secret, node_id, timestamp, nonce, body)
            .map_err(|_| AuthError::BadSignature)?;
        // constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        Ok(VerifiedSender {
            node_id: node_id.to_string(),
            timestamp,
            nonce: nonce.to_string(),
        })
    }
}

fn required<'a, H>(headers: &'a H, name: &'static str) -> Result<&'a str, AuthError>
where
    H: HeaderSource + ?Sized,
{
    match headers.header(name).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AuthError::MissingHeader(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000;
    const BODY: &[u8] = br#"{"tds":410.0,"ph":7.1,"turbidity":2.0,"water_temp_c":14.5}"#;

    fn verifier() -> Verifier {
        Verifier::new(SecurityContext::new(
            [("water_1", "w-secret"), ("ground_1", "g-secret")],
            300,
            600,
        ))
    }

    fn signed(node: &str, secret: &str, ts: i64, nonce: &str, body: &[u8]) -> HashMap<String, String> {
        let sig = sign(secret.as_bytes(), node, ts, nonce, body).unwrap();
        [
            (NODE_HEADER, node.to_string()),
            (TIMESTAMP_HEADER, ts.to_string()),
            (NONCE_HEADER, nonce.to_string()),
            (SIGNATURE_HEADER, sig),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_valid_request_accepted() {
        let v = verifier();
        let h = signed("water_1", "w-secret", NOW - 10, "n-1", BODY);
        let sender = v.verify_at(&h, BODY, NOW).unwrap();
        assert_eq!(sender.node_id, "water_1");
        assert_eq!(sender.timestamp, NOW - 10);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let v = verifier();
        let h: HashMap<String, String> = signed("water_1", "w-secret", NOW, "n-lower", BODY)
            .into_iter()
            .map(|(k, val)| (k.to_lowercase(), val))
            .collect();
        assert!(v.verify_at(&h, BODY, NOW).is_ok());
    }

    #[test]
    fn test_replay_rejected_within_ttl() {
        let v = verifier();
        let h = signed("water_1", "w-secret", NOW, "n-2", BODY);
        assert!(v.verify_at(&h, BODY, NOW).is_ok());
        let err = v.verify_at(&h, BODY, NOW + 1).unwrap_err();
        assert!(matches!(err, AuthError::Replay { .. }));
        assert_eq!(err.public_reason(), "invalid signature");
    }

    #[test]
    fn test_nonce_reusable_after_ttl() {
        let v = verifier();
        let first = signed("water_1", "w-secret", NOW, "n-3", BODY);
        assert!(v.verify_at(&first, BODY, NOW).is_ok());
        let later = NOW + 601;
        let again = signed("water_1", "w-secret", later, "n-3", BODY);
        assert!(v.verify_at(&again, BODY, later).is_ok());
    }

    #[test]
    fn test_tampering_breaks_signature() {
        let v = verifier();

        let h = signed("water_1", "w-secret", NOW, "n-body", BODY);
        let mut tampered = BODY.to_vec();
        tampered[8] ^= 0x01;
        assert_eq!(v.verify_at(&h, &tampered, NOW), Err(AuthError::BadSignature));

        let mut h = signed("water_1", "w-secret", NOW, "n-ts", BODY);
        h.insert(TIMESTAMP_HEADER.into(), (NOW - 1).to_string());
        assert_eq!(v.verify_at(&h, BODY, NOW), Err(AuthError::BadSignature));

        let mut h = signed("water_1", "w-secret", NOW, "n-nonce", BODY);
        h.insert(NONCE_HEADER.into(), "n-nonce2".into());
        assert_eq!(v.verify_at(&h, BODY, NOW), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let v = verifier();
        let h = signed("water_1", "g-secret", NOW, "n-4", BODY);
        assert_eq!(v.verify_at(&h, BODY, NOW), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_stale_timestamp_does_not_touch_nonce_store() {
        let v = verifier();
        let h = signed("ground_1", "g-secret", NOW - 301, "n-5", BODY);
        let err = v.verify_at(&h, BODY, NOW).unwrap_err();
        assert!(matches!(err, AuthError::StaleTimestamp { .. }));
        assert_eq!(v.nonces.len_for("ground_1"), 0);

        let h = signed("ground_1", "g-secret", NOW + 300, "n-6", BODY);
        assert!(v.verify_at(&h, BODY, NOW).is_ok());
    }

    #[test]
    fn test_future_dated_message_cannot_replay_while_fresh() {
        let mut config = crate::config::AppConfig::default();
        config
            .security
            .hmac_secrets
            .insert("water_1".into(), "w-secret".into());
        config.validate().unwrap();
        let v = Verifier::new(SecurityContext::from_config(&config.security));
        let window = config.security.sig_window_sec as i64;

        let h = signed("water_1", "w-secret", NOW + window, "n-future", BODY);
        assert!(v.verify_at(&h, BODY, NOW).is_ok());
        // the timestamp is still inside the window until NOW + 2 * window
        for later in [NOW + window + 1, NOW + 2 * window] {
            let err = v.verify_at(&h, BODY, later).unwrap_err();
            assert!(matches!(err, AuthError::Replay { .. }), "accepted at {later}");
        }
        let err = v.verify_at(&h, BODY, NOW + 2 * window + 1).unwrap_err();
        assert!(matches!(err, AuthError::StaleTimestamp { .. }));
    }

    #[test]
    fn test_unknown_node() {
        let v = verifier();
        let h = signed("ground_9", "whatever", NOW, "n-7", BODY);
        let err = v.verify_at(&h, BODY, NOW).unwrap_err();
        assert_eq!(err, AuthError::UnknownNode("ground_9".into()));
        assert_eq!(err.public_reason(), "invalid signature");
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let v = verifier();
        let mut h = signed("water_1", "w-secret", NOW, "n-8", BODY);
        h.remove(SIGNATURE_HEADER);
        let err = v.verify_at(&h, BODY, NOW).unwrap_err();
        assert_eq!(err, AuthError::MissingHeader(SIGNATURE_HEADER));
        assert_eq!(err.public_reason(), "missing or malformed signature headers");

        let mut h = signed("water_1", "w-secret", NOW, "n-9", BODY);
        h.insert(TIMESTAMP_HEADER.into(), "yesterday".into());
        assert_eq!(
            v.verify_at(&h, BODY, NOW),
            Err(AuthError::MalformedHeader(TIMESTAMP_HEADER))
        );

        let mut h = signed("water_1", "w-secret", NOW, "n-10", BODY);
        h.insert(SIGNATURE_HEADER.into(), "zz-not-hex".into());
        assert_eq!(
            v.verify_at(&h, BODY, NOW),
            Err(AuthError::MalformedHeader(SIGNATURE_HEADER))
        );

        let h = signed("water_1", "w-secret", NOW, "a.b", BODY);
        assert_eq!(
            v.verify_at(&h, BODY, NOW),
            Err(AuthError::MalformedHeader(NONCE_HEADER))
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let ctx = SecurityContext::new([("ground_1", "top-secret")], 300, 600);
        let out = format!("{ctx:?}");
        assert!(out.contains("ground_1"));
        assert!(!out.contains("top-secret"));
    }
}
