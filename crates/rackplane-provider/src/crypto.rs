//! Envelope encryption.
//!
//! A fresh data key is drawn from the KMS for every message. The sealed
//! form is JSON `{"c": ciphertext, "k": encrypted data key, "n": nonce}`
//! with each field base64-encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rackplane_substrate::Kms;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "c", with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(rename = "k", with = "b64")]
    pub encrypted_key: Vec<u8>,
    #[serde(rename = "n", with = "b64")]
    pub nonce: Vec<u8>,
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Seal `plaintext` under a new data key from `key_id`.
pub async fn encrypt(kms: &dyn Kms, key_id: &str, plaintext: &[u8]) -> ProviderResult<Vec<u8>> {
    let data_key = kms.generate_data_key(key_id, KEY_LENGTH).await?;
    let nonce = kms.generate_random(NONCE_LENGTH).await?;
    if nonce.len() != NONCE_LENGTH {
        return Err(ProviderError::internal("kms returned a short nonce"));
    }

    let cipher = XSalsa20Poly1305::new_from_slice(&data_key.plaintext)
        .map_err(|_| ProviderError::internal("kms returned a data key of the wrong length"))?;
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| ProviderError::internal("seal failed"))?;

    let envelope = Envelope {
        ciphertext,
        encrypted_key: data_key.ciphertext,
        nonce,
    };
    debug!(%key_id, bytes = plaintext.len(), "sealed envelope");
    Ok(serde_json::to_vec(&envelope)?)
}

/// Open a sealed envelope. Every failure is [`ProviderError::DecryptionFailed`].
pub async fn decrypt(kms: &dyn Kms, sealed: &[u8]) -> ProviderResult<Vec<u8>> {
    let envelope: Envelope = serde_json::from_slice(sealed).map_err(|_| ProviderError::DecryptionFailed)?;
    if envelope.nonce.len() != NONCE_LENGTH {
        return Err(ProviderError::DecryptionFailed);
    }

    let key = kms
        .decrypt(&envelope.encrypted_key)
        .await
        .map_err(|_| ProviderError::DecryptionFailed)?;
    let cipher = XSalsa20Poly1305::new_from_slice(&key).map_err(|_| ProviderError::DecryptionFailed)?;
    cipher
        .decrypt(GenericArray::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
        .map_err(|_| ProviderError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rackplane_substrate::memory::MemoryKms;

    #[tokio::test]
    async fn seal_then_open() {
        let kms = MemoryKms::new();
        let sealed = encrypt(&kms, "rack-key", b"FOO=bar").await.unwrap();
        let text = String::from_utf8(sealed.clone()).unwrap();
        assert!(text.contains("\"c\"") && text.contains("\"k\"") && text.contains("\"n\""));
        assert!(!text.contains("FOO=bar"));

        assert_eq!(decrypt(&kms, &sealed).await.unwrap(), b"FOO=bar");
        assert_eq!(kms.data_keys(), 1);
    }

    #[tokio::test]
    async fn tampering_is_opaque() {
        let kms = MemoryKms::new();
        let sealed = encrypt(&kms, "rack-key", b"secret").await.unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&sealed).unwrap();

        let mut flipped = envelope.clone();
        flipped.ciphertext[0] ^= 0xff;
        let err = decrypt(&kms, &serde_json::to_vec(&flipped).unwrap()).await.unwrap_err();
        assert!(matches!(err, ProviderError::DecryptionFailed));

        envelope.encrypted_key = b"unknown".to_vec();
        let err = decrypt(&kms, &serde_json::to_vec(&envelope).unwrap()).await.unwrap_err();
        assert!(matches!(err, ProviderError::DecryptionFailed));

        let err = decrypt(&kms, b"not json").await.unwrap_err();
        assert!(matches!(err, ProviderError::DecryptionFailed));
    }

    proptest! {
        #[test]
        fn any_plaintext_round_trips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let kms = MemoryKms::new();
            let opened = rt.block_on(async {
                let sealed = encrypt(&kms, "k", &data).await.unwrap();
                decrypt(&kms, &sealed).await.unwrap()
            });
            prop_assert_eq!(opened, data);
        }
    }
}
