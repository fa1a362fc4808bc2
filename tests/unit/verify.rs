use hmac::{Hmac, Mac};
use sha2::Sha256;
use wa_inbox::verify::{check_signature, handshake_response, SignatureCheck};

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[test]
fn test_valid_signature_accepted() {
    let body = br#"{"object":"whatsapp_business_account","entry":[]}"#;
    let header = sign("app-secret", body);
    assert_eq!(
        check_signature(Some("app-secret"), Some(&header), body),
        SignatureCheck::Valid
    );
}

#[test]
fn test_signature_over_different_body_rejected() {
    let header = sign("app-secret", b"body-a");
    assert_eq!(
        check_signature(Some("app-secret"), Some(&header), b"body-b"),
        SignatureCheck::Invalid
    );
}

#[test]
fn test_signature_with_wrong_secret_rejected() {
    let body = b"payload";
    let header = sign("other", body);
    assert_eq!(
        check_signature(Some("app-secret"), Some(&header), body),
        SignatureCheck::Invalid
    );
}

#[test]
fn test_header_without_prefix_still_verifies() {
    let body = b"payload";
    let header = sign("app-secret", body);
    let bare = header.trim_start_matches("sha256=");
    assert_eq!(
        check_signature(Some("app-secret"), Some(bare), body),
        SignatureCheck::Valid
    );
}

#[test]
fn test_missing_header_rejected() {
    assert_eq!(
        check_signature(Some("app-secret"), None, b"payload"),
        SignatureCheck::Missing
    );
}

#[test]
fn test_garbage_hex_rejected() {
    assert_eq!(
        check_signature(Some("app-secret"), Some("sha256=not-hex!"), b"payload"),
        SignatureCheck::Invalid
    );
}

#[test]
fn test_unconfigured_secret_skips_verification() {
    let result = check_signature(None, None, b"payload");
    assert_eq!(result, SignatureCheck::Skipped);
    assert!(result.accepted());
}

#[test]
fn test_rejections_are_not_accepted() {
    assert!(!SignatureCheck::Invalid.accepted());
    assert!(!SignatureCheck::Missing.accepted());
    assert!(SignatureCheck::Valid.accepted());
}

#[test]
fn test_handshake_echoes_challenge() {
    let challenge = handshake_response(
        Some("verify-token"),
        Some("subscribe"),
        Some("verify-token"),
        Some("1158201444"),
    );
    assert_eq!(challenge.as_deref(), Some("1158201444"));
}

#[test]
fn test_handshake_rejects_token_mismatch() {
    assert!(handshake_response(
        Some("verify-token"),
        Some("subscribe"),
        Some("guess"),
        Some("1158201444"),
    )
    .is_none());
}

#[test]
fn test_handshake_rejects_without_configured_token() {
    assert!(handshake_response(None, Some("subscribe"), Some("x"), Some("c")).is_none());
    assert!(handshake_response(Some("  "), Some("subscribe"), Some("x"), Some("c")).is_none());
}
