use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::Serialize;

const KEY_LEN: usize = 32;

/// Seals provider credentials at rest with AES-256-GCM.
///
/// Sealed values are `base64(nonce || ciphertext || tag)` with a random
/// 96-bit nonce per value.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64_STANDARD
            .decode(encoded.trim())
            .context("credentials key is not valid base64")?;
        let key: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| anyhow!("credentials key must be {} bytes", KEY_LEN))?;
        Ok(Self { key })
    }

    fn sealing_key(&self) -> Result<LessSafeKey> {
        let unbound =
            UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| anyhow!("construct AES-256-GCM key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let key = self.sealing_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("generate credential nonce"))?;

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| anyhow!("seal credentials"))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);
        Ok(BASE64_STANDARD.encode(envelope))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let envelope = BASE64_STANDARD
            .decode(sealed.trim())
            .context("sealed credentials are not valid base64")?;
        if envelope.len() < NONCE_LEN {
            return Err(anyhow!("sealed credentials are truncated"));
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| anyhow!("invalid credential nonce"))?;

        let key = self.sealing_key()?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("open sealed credentials"))?;
        Ok(plaintext.to_vec())
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let raw = serde_json::to_vec(value).context("serialize credentials")?;
        self.seal(&raw)
    }

    pub fn open_json<T: DeserializeOwned>(&self, sealed: &str) -> Result<T> {
        let raw = self.open(sealed)?;
        serde_json::from_slice(&raw).context("parse opened credentials")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::from_base64(&BASE64_STANDARD.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = cipher();
        let sealed = cipher.seal(b"refresh-token").unwrap();
        assert_ne!(sealed, cipher.seal(b"refresh-token").unwrap());
        assert_eq!(cipher.open(&sealed).unwrap(), b"refresh-token");
    }

    #[test]
    fn test_tampered_value_is_rejected() {
        let cipher = cipher();
        let sealed = cipher.seal(b"secret").unwrap();
        let mut raw = BASE64_STANDARD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(cipher.open(&BASE64_STANDARD.encode(raw)).is_err());
        assert!(cipher.open("AAAA").is_err());
    }

    #[test]
    fn test_key_length_is_checked() {
        assert!(CredentialCipher::from_base64(&BASE64_STANDARD.encode([1u8; 16])).is_err());
    }
}
