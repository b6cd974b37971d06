//! Shared reqwest plumbing for store API clients.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::ports::StoreError;

pub(crate) fn build_client(timeout: Duration) -> Result<Client, StoreError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {}", e)))
}

pub(crate) fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(0)
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

/// Maps non-2xx answers onto [`StoreError`]; `not_found_key` names the missing record.
pub(crate) async fn check_status(response: Response, not_found_key: &str) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 404 || status.as_u16() == 410 {
        return Err(StoreError::NotFound(not_found_key.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Rejected {
        status: status.as_u16(),
        message: truncate(&message, 512),
    })
}

pub(crate) async fn json_body<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    response
        .json::<T>()
        .await
        .map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_error_bodies() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
