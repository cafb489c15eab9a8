//! Ed25519 authenticity checks for oracle data points.
//!
//! Signatures and public keys are accepted hex encoded (canonical) or base64
//! encoded (fallback). The signed payload is `"{source_id}:{timestamp}:{value}"`
//! with `value` rendered by Rust's shortest round-trip `f64` formatting.

use std::collections::HashSet;

use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Shortest accepted encoded signature (unpadded base64 of 64 bytes)
pub const MIN_ENCODED_SIGNATURE_LEN: usize = 86;
/// Longest accepted encoded signature (hex of 64 bytes)
pub const MAX_ENCODED_SIGNATURE_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
pub enum SignatureRejection {
    #[error("signature missing")]
    Missing,
    #[error("signature length {0} outside accepted range")]
    BadLength(usize),
    #[error("signature contains characters outside the hex/base64 alphabets")]
    BadCharset,
    #[error("signature encoding not recognized")]
    UnrecognizedEncoding,
    #[error("public key invalid")]
    InvalidPublicKey,
    #[error("signature does not verify against payload")]
    VerificationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignatureEncoding {
    Hex,
    Base64,
}

/// Outcome of verifying one signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureCheck {
    pub valid: bool,
    pub encoding: Option<SignatureEncoding>,
    pub reason: Option<SignatureRejection>,
}

impl SignatureCheck {
    fn rejected(reason: SignatureRejection, encoding: Option<SignatureEncoding>) -> Self {
        Self {
            valid: false,
            encoding,
            reason: Some(reason),
        }
    }
}

/// One source's signature over a shared payload
#[derive(Debug, Clone)]
pub struct Attestation {
    pub source_id: String,
    pub public_key: String,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiSignatureResult {
    pub valid_count: usize,
    pub total_count: usize,
    pub required: usize,
    pub consensus_met: bool,
    pub rejections: Vec<(String, SignatureRejection)>,
}

pub struct SignatureVerifier;

impl SignatureVerifier {
    /// Bytes a source signs for one reading.
    pub fn signing_payload(source_id: &str, timestamp: i64, value: f64) -> Vec<u8> {
        format!("{}:{}:{}", source_id, timestamp, value).into_bytes()
    }

    /// Bytes every source signs when jointly attesting to one feed reading.
    pub fn attestation_payload(feed_id: Uuid, timestamp: i64, value: f64) -> Vec<u8> {
        format!("{}:{}:{}", feed_id, timestamp, value).into_bytes()
    }

    /// Cheap format gate that runs before any decoding or curve arithmetic.
    pub fn precheck(signature: Option<&str>) -> Result<&str, SignatureRejection> {
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SignatureRejection::Missing)?;

        let len = signature.len();
        if !(MIN_ENCODED_SIGNATURE_LEN..=MAX_ENCODED_SIGNATURE_LEN).contains(&len) {
            return Err(SignatureRejection::BadLength(len));
        }

        let charset_ok = signature
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=');
        if !charset_ok {
            return Err(SignatureRejection::BadCharset);
        }

        Ok(signature)
    }

    /// Decode a signature, trying hex first and base64 second.
    pub fn decode_signature(
        signature: &str,
    ) -> Result<([u8; SIGNATURE_LENGTH], SignatureEncoding), SignatureRejection> {
        decode_fixed::<SIGNATURE_LENGTH>(signature).ok_or(SignatureRejection::UnrecognizedEncoding)
    }

    pub fn decode_public_key(public_key: &str) -> Result<VerifyingKey, SignatureRejection> {
        let (bytes, _) = decode_fixed::<PUBLIC_KEY_LENGTH>(public_key.trim())
            .ok_or(SignatureRejection::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureRejection::InvalidPublicKey)
    }

    pub fn verify(payload: &[u8], signature: Option<&str>, public_key: &str) -> SignatureCheck {
        let signature = match Self::precheck(signature) {
            Ok(sig) => sig,
            Err(reason) => return SignatureCheck::rejected(reason, None),
        };

        let (sig_bytes, encoding) = match Self::decode_signature(signature) {
            Ok(decoded) => decoded,
            Err(reason) => return SignatureCheck::rejected(reason, None),
        };

        let key = match Self::decode_public_key(public_key) {
            Ok(key) => key,
            Err(reason) => return SignatureCheck::rejected(reason, Some(encoding)),
        };

        let signature = Signature::from_bytes(&sig_bytes);
        match key.verify_strict(payload, &signature) {
            Ok(()) => SignatureCheck {
                valid: true,
                encoding: Some(encoding),
                reason: None,
            },
            Err(_) => {
                SignatureCheck::rejected(SignatureRejection::VerificationFailed, Some(encoding))
            }
        }
    }

    /// Verify several sources attesting to the same payload. Each source counts once.
    pub fn verify_attestations(
        payload: &[u8],
        attestations: &[Attestation],
        required: Option<usize>,
    ) -> MultiSignatureResult {
        let mut seen = HashSet::new();
        let mut valid_count = 0;
        let mut total_count = 0;
        let mut rejections = Vec::new();

        for attestation in attestations {
            if !seen.insert(attestation.source_id.as_str()) {
                continue;
            }
            total_count += 1;

            let check = Self::verify(
                payload,
                attestation.signature.as_deref(),
                &attestation.public_key,
            );
            match check.reason {
                None => valid_count += 1,
                Some(reason) => rejections.push((attestation.source_id.clone(), reason)),
            }
        }

        let required = required.unwrap_or_else(|| majority(total_count));
        MultiSignatureResult {
            valid_count,
            total_count,
            required,
            consensus_met: total_count > 0 && valid_count >= required,
            rejections,
        }
    }
}

/// ceil(n / 2)
pub fn majority(n: usize) -> usize {
    (n + 1) / 2
}

fn decode_fixed<const N: usize>(encoded: &str) -> Option<([u8; N], SignatureEncoding)> {
    let candidates: [(SignatureEncoding, Option<Vec<u8>>); 3] = [
        (SignatureEncoding::Hex, hex::decode(encoded).ok()),
        (SignatureEncoding::Base64, STANDARD.decode(encoded).ok()),
        (SignatureEncoding::Base64, STANDARD_NO_PAD.decode(encoded).ok()),
    ];

    candidates.into_iter().find_map(|(encoding, decoded)| {
        let bytes: [u8; N] = decoded?.try_into().ok()?;
        Some((bytes, encoding))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use proptest::prelude::*;

    fn keypair(seed: u8) -> (SigningKey, String) {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let public = hex::encode(signing.verifying_key().to_bytes());
        (signing, public)
    }

    #[test]
    fn accepts_hex_and_base64_signatures() {
        let (signing, public) = keypair(7);
        let payload = SignatureVerifier::signing_payload("meter-a", 1_700_000_000, 100.5);
        let sig = signing.sign(&payload).to_bytes();

        let hex_check = SignatureVerifier::verify(&payload, Some(&hex::encode(sig)), &public);
        assert!(hex_check.valid);
        assert_eq!(hex_check.encoding, Some(SignatureEncoding::Hex));

        let b64_check = SignatureVerifier::verify(&payload, Some(&STANDARD.encode(sig)), &public);
        assert!(b64_check.valid);
        assert_eq!(b64_check.encoding, Some(SignatureEncoding::Base64));

        let unpadded = STANDARD_NO_PAD.encode(sig);
        assert_eq!(unpadded.len(), MIN_ENCODED_SIGNATURE_LEN);
        assert!(SignatureVerifier::verify(&payload, Some(&unpadded), &public).valid);
    }

    #[test]
    fn precheck_rejects_cheaply() {
        assert_eq!(
            SignatureVerifier::precheck(None),
            Err(SignatureRejection::Missing)
        );
        assert_eq!(
            SignatureVerifier::precheck(Some("   ")),
            Err(SignatureRejection::Missing)
        );
        assert_eq!(
            SignatureVerifier::precheck(Some("abcd")),
            Err(SignatureRejection::BadLength(4))
        );
        let bad_chars = "z!".repeat(50);
        assert_eq!(
            SignatureVerifier::precheck(Some(&bad_chars)),
            Err(SignatureRejection::BadCharset)
        );
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (signing, _) = keypair(1);
        let (_, other_public) = keypair(2);
        let payload = SignatureVerifier::signing_payload("meter-a", 10, 1.0);
        let sig = hex::encode(signing.sign(&payload).to_bytes());

        let check = SignatureVerifier::verify(&payload, Some(&sig), &other_public);
        assert!(!check.valid);
        assert_eq!(check.reason, Some(SignatureRejection::VerificationFailed));
    }

    #[test]
    fn malformed_public_key_is_reported() {
        let (signing, _) = keypair(3);
        let payload = SignatureVerifier::signing_payload("meter-a", 10, 1.0);
        let sig = hex::encode(signing.sign(&payload).to_bytes());
        let check = SignatureVerifier::verify(&payload, Some(&sig), "not-a-key");
        assert_eq!(check.reason, Some(SignatureRejection::InvalidPublicKey));
    }

    #[test]
    fn attestations_count_each_source_once() {
        let payload = SignatureVerifier::signing_payload("feed", 1, 42.0);
        let mut attestations = Vec::new();
        for seed in 1..=3u8 {
            let (signing, public) = keypair(seed);
            attestations.push(Attestation {
                source_id: format!("src-{}", seed),
                public_key: public,
                signature: Some(hex::encode(signing.sign(&payload).to_bytes())),
            });
        }
        attestations.push(attestations[0].clone());
        let (_, public) = keypair(9);
        attestations.push(Attestation {
            source_id: "src-9".into(),
            public_key: public,
            signature: None,
        });

        let result = SignatureVerifier::verify_attestations(&payload, &attestations, None);
        assert_eq!(result.total_count, 4);
        assert_eq!(result.valid_count, 3);
        assert_eq!(result.required, 2);
        assert!(result.consensus_met);
        assert_eq!(
            result.rejections,
            vec![("src-9".to_string(), SignatureRejection::Missing)]
        );

        let strict = SignatureVerifier::verify_attestations(&payload, &attestations, Some(4));
        assert!(!strict.consensus_met);
    }

    #[test]
    fn majority_is_ceil_half() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(5), 3);
    }

    proptest! {
        #[test]
        fn flipping_any_byte_breaks_verification(
            seed in 1u8..=255,
            timestamp in 0i64..4_000_000_000,
            value in 0.0f64..1.0e9,
            flip_payload in any::<bool>(),
            index in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let (signing, public) = keypair(seed);
            let mut payload = SignatureVerifier::signing_payload("meter-a", timestamp, value);
            let mut sig = signing.sign(&payload).to_bytes();

            prop_assert!(SignatureVerifier::verify(&payload, Some(&hex::encode(sig)), &public).valid);

            if flip_payload {
                let i = index.index(payload.len());
                payload[i] ^= mask;
            } else {
                let i = index.index(sig.len());
                sig[i] ^= mask;
            }
            prop_assert!(!SignatureVerifier::verify(&payload, Some(&hex::encode(sig)), &public).valid);
        }
    }
}
