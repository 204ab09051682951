use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

fn tag(key: &[u8], value: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(value.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

/// Compares a notification's client secret with the stored one in constant
/// time by comparing their HMACs under `key`.
pub fn verify_client_state(key: &str, expected: &str, provided: &str) -> bool {
    let Some(expected_tag) = tag(key.as_bytes(), expected) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(provided.as_bytes());
    mac.verify_slice(&expected_tag).is_ok()
}

/// Random secret handed to the provider with a new subscription.
pub fn generate_client_state() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_secret_verifies() {
        let secret = generate_client_state();
        assert_eq!(secret.len(), 64);
        assert!(verify_client_state("key", &secret, &secret));
        assert!(!verify_client_state("key", &secret, "guess"));
        assert!(!verify_client_state("key", &secret, ""));
        assert_ne!(secret, generate_client_state());
    }
}
