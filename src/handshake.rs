// Handshake frame verification.
//
// The first framed payload on a gated connection is a JSON handshake:
//
//   {"type":"handshake","version":"v1","tags":{"role":"a"}}
//
// An attested handshake additionally carries a base64 ed25519 public key,
// a signature over the canonical JSON (top-level "signature" omitted), and
// two values derived from the public key: a scalar index in [0, 1] and a
// SHA-256 fingerprint binding the key to that index. Verification recomputes
// both derivations and checks the signature.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::to_canonical_json;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Frame is not a JSON object with `"type":"handshake"`.
    NotHandshake,
    /// A required field is absent or has the wrong type.
    MissingField(&'static str),
    /// Peer announced a protocol version that differs from ours.
    VersionMismatch { expected: String, got: String },
    /// A base64 field failed to decode.
    BadBase64(&'static str),
    /// Public key bytes are not a valid ed25519 key.
    BadKey,
    /// The announced fingerprint does not match the recomputed one.
    HashMismatch,
    /// Signature verification failed.
    BadSignature,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotHandshake => write!(f, "first frame is not a handshake"),
            Self::MissingField(name) => write!(f, "handshake missing field '{name}'"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "protocol version mismatch: expected '{expected}', got '{got}'")
            }
            Self::BadBase64(field) => write!(f, "handshake field '{field}' is not valid base64"),
            Self::BadKey => write!(f, "handshake public key is not a valid ed25519 key"),
            Self::HashMismatch => write!(f, "handshake fingerprint mismatch"),
            Self::BadSignature => write!(f, "handshake signature verification failed"),
        }
    }
}

impl std::error::Error for HandshakeError {}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Peer metadata extracted from a verified handshake, surfaced on
/// `connection` and `message` events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandshakeInfo {
    pub version: Option<String>,
    /// Free-form peer tags; string and number values only.
    pub tags: BTreeMap<String, Value>,
    pub n_index: Option<f64>,
    pub neg_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Key-derived values
// ---------------------------------------------------------------------------

/// Derive the scalar index in [0, 1] for a public key: the coherence ratio
/// (first byte over the byte sum) divided by the Shannon entropy of the
/// byte histogram. Non-finite results map to 0.
pub fn n_index(public_key: &[u8]) -> f64 {
    let mut histogram = [0usize; 256];
    for &b in public_key {
        histogram[b as usize] += 1;
    }
    let len = public_key.len() as f64;
    let mut entropy = 0.0f64;
    if len > 0.0 {
        for &count in histogram.iter() {
            if count > 0 {
                let p = count as f64 / len;
                entropy -= p * p.log2();
            }
        }
    }
    if entropy <= 0.0 {
        entropy = 1e-6;
    }

    let sum: f64 = public_key.iter().map(|&b| b as f64).sum();
    let denom = if sum > 0.0 { sum } else { 1.0 };
    let coherence = public_key.first().copied().unwrap_or(0) as f64 / denom;

    let index = coherence / entropy;
    if !index.is_finite() {
        return 0.0;
    }
    index.clamp(0.0, 1.0)
}

/// Derive the fingerprint binding a public key to its index: lowercase hex
/// SHA-256 over the key, the xor-salted key, and the index formatted to
/// six decimals. The salt mask is `floor(clamp(index, 0, 1) * 255)`.
pub fn neg_hash(public_key: &[u8], n_index: f64) -> String {
    let mask = (n_index.clamp(0.0, 1.0) * 255.0).floor() as u8;
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let salted: Vec<u8> = public_key.iter().map(|&b| b ^ mask).collect();
    hasher.update(&salted);
    hasher.update(format!("{n_index:.6}").as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Validate a handshake frame and extract its metadata.
///
/// `expected_version` is the server's configured protocol version; a
/// non-empty frame version that differs from a non-empty expectation is
/// rejected. When the frame carries all four attestation fields
/// (`publicKey`, `signature`, `negHash`, `nIndex`) the fingerprint is
/// recomputed and the ed25519 signature checked over the canonical JSON
/// with the top-level `signature` member omitted.
pub fn verify_handshake(
    root: &Value,
    expected_version: Option<&str>,
) -> Result<HandshakeInfo, HandshakeError> {
    let obj = root.as_object().ok_or(HandshakeError::NotHandshake)?;

    let frame_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(HandshakeError::MissingField("type"))?;
    if frame_type != "handshake" {
        return Err(HandshakeError::NotHandshake);
    }

    let version = obj.get("version").and_then(Value::as_str).map(str::to_owned);
    if let (Some(expected), Some(got)) = (expected_version, version.as_deref()) {
        if !expected.is_empty() && !got.is_empty() && got != expected {
            return Err(HandshakeError::VersionMismatch {
                expected: expected.to_owned(),
                got: got.to_owned(),
            });
        }
    }

    let attested = ["publicKey", "signature", "negHash", "nIndex"]
        .iter()
        .all(|k| obj.contains_key(*k));
    if attested {
        verify_attestation(root, obj)?;
    }

    let tags = obj
        .get("tags")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(_, v)| v.is_string() || v.is_number())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    Ok(HandshakeInfo {
        version,
        tags,
        n_index: obj.get("nIndex").and_then(Value::as_f64),
        neg_hash: obj.get("negHash").and_then(Value::as_str).map(str::to_owned),
    })
}

fn verify_attestation(
    root: &Value,
    obj: &serde_json::Map<String, Value>,
) -> Result<(), HandshakeError> {
    let public_key_b64 = obj
        .get("publicKey")
        .and_then(Value::as_str)
        .ok_or(HandshakeError::MissingField("publicKey"))?;
    let signature_b64 = obj
        .get("signature")
        .and_then(Value::as_str)
        .ok_or(HandshakeError::MissingField("signature"))?;
    let claimed_hash = obj
        .get("negHash")
        .and_then(Value::as_str)
        .ok_or(HandshakeError::MissingField("negHash"))?;

    let public_key = BASE64
        .decode(public_key_b64)
        .map_err(|_| HandshakeError::BadBase64("publicKey"))?;
    let signature = BASE64
        .decode(signature_b64)
        .map_err(|_| HandshakeError::BadBase64("signature"))?;

    let index = n_index(&public_key);
    if neg_hash(&public_key, index) != claimed_hash {
        return Err(HandshakeError::HashMismatch);
    }

    let key_bytes: [u8; 32] = public_key
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::BadKey)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| HandshakeError::BadKey)?;
    let sig_bytes: [u8; 64] = signature
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::BadSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let message = to_canonical_json(root);
    key.verify(message.as_bytes(), &sig)
        .map_err(|_| HandshakeError::BadSignature)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
