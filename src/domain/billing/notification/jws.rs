//! Compact JWS decoding for app-store payloads.
//!
//! App-store notifications are ES256 JWS tokens whose header carries an
//! `x5c` certificate chain. Signature checking is delegated to a
//! [`JwsVerifier`] so the trust policy can be swapped without touching the
//! notification mapping.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::Deserialize;

use crate::domain::billing::BillingError;

/// Protected header fields this system inspects.
#[derive(Debug, Clone, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default)]
    pub x5c: Vec<String>,
}

/// Verifies the signature of one JWS.
pub trait JwsVerifier: Send + Sync {
    /// `signing_input` is `<header_b64>.<payload_b64>`; `signature` is the
    /// decoded raw `r || s` value.
    fn verify(
        &self,
        header: &JwsHeader,
        signing_input: &[u8],
        signature: &[u8],
    ) -> Result<(), BillingError>;
}

/// Verifies against a pinned P-256 public key (the store's signing key).
#[derive(Debug, Clone)]
pub struct PinnedKeyVerifier {
    key: VerifyingKey,
}

impl PinnedKeyVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Loads a base64-encoded SubjectPublicKeyInfo DER key ("MFkw...").
    pub fn from_base64_der(encoded: &str) -> Result<Self, BillingError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|e| BillingError::Validation(format!("signing key is not base64: {}", e)))?;
        let key = VerifyingKey::from_public_key_der(&der)
            .map_err(|e| BillingError::Validation(format!("signing key is not P-256 DER: {}", e)))?;
        Ok(Self { key })
    }
}

impl JwsVerifier for PinnedKeyVerifier {
    fn verify(
        &self,
        _header: &JwsHeader,
        signing_input: &[u8],
        signature: &[u8],
    ) -> Result<(), BillingError> {
        let signature = Signature::from_slice(signature)
            .map_err(|_| BillingError::InvalidSignature("signature is not a P-256 r||s pair".into()))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        self.key
            .verify(signing_input, &signature)
            .map_err(|_| BillingError::InvalidSignature("ES256 signature mismatch".into()))
    }
}

/// Decodes and verifies a compact JWS, returning its JSON payload.
pub(crate) fn decode_verified(
    token: &str,
    verifier: &dyn JwsVerifier,
) -> Result<serde_json::Value, BillingError> {
    let mut parts = token.trim().split('.');
    let (header_b64, payload_b64, signature_b64) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => (h, p, s),
            _ => {
                return Err(BillingError::MalformedPayload(
                    "JWS must have exactly three segments".into(),
                ))
            }
        };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| BillingError::MalformedPayload("JWS header is not base64url".into()))?;
    let header: JwsHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| BillingError::MalformedPayload(format!("JWS header: {}", e)))?;

    check_header(&header)?;

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| BillingError::InvalidSignature("JWS signature is not base64url".into()))?;

    let signing_input = format!("{}.{}", header_b64, payload_b64);
    verifier.verify(&header, signing_input.as_bytes(), &signature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| BillingError::MalformedPayload("JWS payload is not base64url".into()))?;
    serde_json::from_slice(&payload)
        .map_err(|e| BillingError::MalformedPayload(format!("JWS payload: {}", e)))
}

/// Structural checks before any cryptography: algorithm pinning and a
/// well-formed certificate chain.
fn check_header(header: &JwsHeader) -> Result<(), BillingError> {
    if header.alg != "ES256" {
        return Err(BillingError::InvalidSignature(format!(
            "unexpected JWS algorithm {}",
            header.alg
        )));
    }
    if header.x5c.is_empty() {
        return Err(BillingError::InvalidSignature("missing x5c certificate chain".into()));
    }
    for cert in &header.x5c {
        let der = STANDARD
            .decode(cert)
            .map_err(|_| BillingError::InvalidSignature("x5c entry is not base64 DER".into()))?;
        // DER certificates start with a SEQUENCE tag
        if der.first() != Some(&0x30) {
            return Err(BillingError::InvalidSignature("x5c entry is not a DER certificate".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;

    pub fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[7u8; 32]).unwrap()
    }

    pub fn verifier() -> PinnedKeyVerifier {
        PinnedKeyVerifier::new(signing_key().verifying_key().clone())
    }

    /// Signs `payload` as an ES256 JWS with a dummy one-certificate chain.
    pub fn sign(payload: &serde_json::Value) -> String {
        let header = serde_json::json!({"alg": "ES256", "x5c": [STANDARD.encode([0x30, 0x82, 0x01])]});
        let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
        let input = format!("{}.{}", header_b64, payload_b64);
        let signature: Signature = signing_key().sign(input.as_bytes());
        format!("{}.{}", input, URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }
}
