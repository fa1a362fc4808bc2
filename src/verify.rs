use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

/// Outcome of checking an inbound batch's X-Hub-Signature-256 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    Missing,
    /// No app secret configured; verification cannot be performed.
    Skipped,
}

impl SignatureCheck {
    pub fn accepted(self) -> bool {
        matches!(self, SignatureCheck::Valid | SignatureCheck::Skipped)
    }
}

/// Verify the keyed hash of the raw request body against the signature
/// header. The header carries `sha256=<hex>`; comparison is constant-time
/// via the mac's own verifier.
pub fn check_signature(
    app_secret: Option<&str>,
    signature_header: Option<&str>,
    body: &[u8],
) -> SignatureCheck {
    let Some(secret) = app_secret.filter(|s| !s.trim().is_empty()) else {
        warn!("inbound signature verification skipped: no app secret configured");
        return SignatureCheck::Skipped;
    };

    let Some(header) = signature_header else {
        return SignatureCheck::Missing;
    };
    let signature = header.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return SignatureCheck::Missing;
    }

    let Ok(signature_bytes) = hex::decode(signature) else {
        return SignatureCheck::Invalid;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return SignatureCheck::Invalid;
    };
    mac.update(body);
    if mac.verify_slice(&signature_bytes).is_ok() {
        SignatureCheck::Valid
    } else {
        SignatureCheck::Invalid
    }
}

/// Webhook subscription handshake. The platform sends
/// `hub.mode=subscribe&hub.verify_token=...&hub.challenge=...` and expects
/// the challenge echoed back as plain text when the token matches.
pub fn handshake_response(
    expected_token: Option<&str>,
    mode: Option<&str>,
    verify_token: Option<&str>,
    challenge: Option<&str>,
) -> Option<String> {
    let expected = expected_token.filter(|t| !t.trim().is_empty())?;
    if mode? != "subscribe" {
        return None;
    }
    if verify_token? != expected {
        return None;
    }
    challenge.map(|c| c.to_string())
}
