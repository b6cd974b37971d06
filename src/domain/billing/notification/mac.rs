//! HMAC-SHA256 helpers shared by the HMAC-signed store formats.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::domain::billing::BillingError;

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, BillingError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| BillingError::InvalidSignature("unusable signing key".to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Length-checked constant-time comparison.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
