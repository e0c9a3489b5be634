// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn sign_verify_roundtrip() {
    let secret = "whsec_test";
    let body = br#"{"topic":"orders.created"}"#;
    let ts = 1_760_000_000_000u64;

    let sig = sign(secret, ts, body);
    assert!(verify(secret, ts, body, &sig));
    assert!(!verify("wrong", ts, body, &sig));
    assert!(!verify(secret, ts + 1, body, &sig));
    assert!(!verify(secret, ts, b"tampered", &sig));
}

#[test]
fn header_format() {
    let header = signature_header("s", 1234, b"body");
    let sig = sign("s", 1234, b"body");
    assert_eq!(header, format!("t=1234,v1={sig}"));
    assert_eq!(sig.len(), 64, "hex-encoded sha256 tag");
}

#[test]
fn garbage_signature_rejected() {
    assert!(!verify("s", 1, b"x", "not-hex"));
    assert!(!verify("s", 1, b"x", ""));
}
