// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Webhook payload signing.
//!
//! The signed message is `{timestamp_ms}.{body}`; the timestamp prefix lets
//! receivers bound the replay window. The header value is
//! `t=<unix-ms>,v1=<hex-hmac-sha256>`.

use ring::hmac;

/// Compute the hex HMAC-SHA-256 over `timestamp.body`.
pub fn sign(secret: &str, timestamp_ms: u64, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let mut message = Vec::with_capacity(20 + body.len());
    message.extend_from_slice(timestamp_ms.to_string().as_bytes());
    message.push(b'.');
    message.extend_from_slice(body);
    hex::encode(hmac::sign(&key, &message).as_ref())
}

/// Build the `X-Signature` header value.
pub fn signature_header(secret: &str, timestamp_ms: u64, body: &[u8]) -> String {
    format!("t={timestamp_ms},v1={}", sign(secret, timestamp_ms, body))
}

/// Verify a hex signature in constant time. Receivers use this; the relay
/// itself only signs.
pub fn verify(secret: &str, timestamp_ms: u64, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let mut message = Vec::with_capacity(20 + body.len());
    message.extend_from_slice(timestamp_ms.to_string().as_bytes());
    message.push(b'.');
    message.extend_from_slice(body);
    hmac::verify(&key, &message, &signature).is_ok()
}

#[cfg(test)]
#[path = "sign_tests.rs"]
mod tests;
