use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header tokens recognized as the signature timestamp.
pub const TIMESTAMP_KEYS: &[&str] = &["t", "timestamp"];

/// Header tokens recognized as the hex HMAC signature.
pub const SIGNATURE_KEYS: &[&str] = &["s", "sig", "signature", "v1"];

const SHA256_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// No shared secret configured; verification fails closed.
    NoSecret,
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    /// Timestamp outside the tolerance window (replay defense).
    StaleTimestamp,
    SignatureMismatch,
}

impl std::fmt::Display for VerificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationError::NoSecret => write!(f, "no webhook secret configured"),
            VerificationError::MissingSignature => write!(f, "signature token missing"),
            VerificationError::MissingTimestamp => write!(f, "timestamp token missing"),
            VerificationError::InvalidTimestamp => write!(f, "timestamp is not a number"),
            VerificationError::StaleTimestamp => write!(f, "timestamp outside tolerance window"),
            VerificationError::SignatureMismatch => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// Timestamp and signature tokens parsed out of a signature header.
#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

/// Parse a comma-separated `key=value` signature header.
///
/// Token order does not matter and unknown keys are ignored. The last
/// occurrence of a recognized key wins.
pub fn parse_signature_header(header: &str) -> ParsedSignature {
    let mut parsed = ParsedSignature::default();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        if TIMESTAMP_KEYS.contains(&key) {
            parsed.timestamp = Some(value.trim().to_string());
        } else if SIGNATURE_KEYS.contains(&key) {
            parsed.signature = Some(value.trim().to_string());
        }
    }
    parsed
}

/// Compute the hex HMAC-SHA256 over `"{timestamp}.{raw}"`.
///
/// The raw request bytes are signed exactly as received; re-serializing the
/// JSON body would change the signature and must never happen before
/// verification.
pub fn compute_signature(secret: &[u8], timestamp: &str, raw: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an inbound webhook signature header against the raw body bytes.
///
/// Pure function: freshness requires `|now - timestamp| <= tolerance_secs`,
/// the comparison is constant-time, and a length mismatch rejects before any
/// byte comparison. An empty secret always rejects.
pub fn verify(
    header: &str,
    raw: &[u8],
    secret: &[u8],
    tolerance_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError> {
    if secret.is_empty() {
        return Err(VerificationError::NoSecret);
    }

    let parsed = parse_signature_header(header);
    let timestamp = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;

    let ts_secs = timestamp
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;
    if now_secs.abs_diff(ts_secs) > tolerance_secs {
        return Err(VerificationError::StaleTimestamp);
    }

    let Ok(provided) = hex::decode(&signature) else {
        return Err(VerificationError::SignatureMismatch);
    };
    if provided.len() != SHA256_LEN {
        return Err(VerificationError::SignatureMismatch);
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw);
    mac.verify_slice(&provided)
        .map_err(|_| VerificationError::SignatureMismatch)
}
