//! HMAC-SHA256 signatures for payment callbacks.
//!
//! The redirect signature covers `order_ref|payment_ref` under the callback
//! secret. The webhook signature covers the raw request body under a
//! separate webhook secret. Both are hex encoded and compared in constant
//! time.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn redirect_payload(order_ref: &str, payment_ref: &str) -> String {
    format!("{order_ref}|{payment_ref}")
}

fn sign(secret: &str, payload: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Signs a redirect callback the way the provider does.
pub fn sign_redirect(
    secret: &str,
    order_ref: &str,
    payment_ref: &str,
) -> Result<String, InvalidLength> {
    sign(secret, redirect_payload(order_ref, payment_ref).as_bytes())
}

/// Verifies a redirect callback signature.
pub fn verify_redirect(secret: &str, order_ref: &str, payment_ref: &str, signature: &str) -> bool {
    verify(
        secret,
        redirect_payload(order_ref, payment_ref).as_bytes(),
        signature,
    )
}

/// Signs a raw webhook body.
pub fn sign_webhook(secret: &str, body: &[u8]) -> Result<String, InvalidLength> {
    sign(secret, body)
}

/// Verifies a webhook signature header over the raw body.
pub fn verify_webhook(secret: &str, body: &[u8], signature: &str) -> bool {
    verify(secret, body, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "callback_secret";

    #[test]
    fn test_redirect_signature_verifies() {
        let sig = sign_redirect(SECRET, "order_1", "pay_1").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(verify_redirect(SECRET, "order_1", "pay_1", &sig));
    }

    #[test]
    fn test_redirect_rejects_tampering() {
        let sig = sign_redirect(SECRET, "order_1", "pay_1").unwrap();

        assert!(!verify_redirect(SECRET, "order_2", "pay_1", &sig));
        assert!(!verify_redirect(SECRET, "order_1", "pay_2", &sig));
        assert!(!verify_redirect("other_secret", "order_1", "pay_1", &sig));
        assert!(!verify_redirect(SECRET, "order_1", "pay_1", "not-hex"));
        assert!(!verify_redirect(SECRET, "order_1", "pay_1", ""));
    }

    #[test]
    fn test_separator_is_part_of_payload() {
        // "ab|c" and "a|bc" must not collide.
        let sig = sign_redirect(SECRET, "ab", "c").unwrap();
        assert!(!verify_redirect(SECRET, "a", "bc", &sig));
    }

    #[test]
    fn test_webhook_signature_covers_raw_bytes() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign_webhook("whsec", body).unwrap();

        assert!(verify_webhook("whsec", body, &sig));
        assert!(verify_webhook("whsec", body, &sig.to_uppercase()));
        assert!(!verify_webhook("whsec", br#"{"event":"payment.captured" }"#, &sig));
        assert!(!verify_webhook(SECRET, body, &sig));
    }
}
