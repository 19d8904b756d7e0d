use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;

use super::random_hex;
use crate::error::{SubstrateError, SubstrateResult};
use crate::kms::*;

/// Data keys are random; their "encrypted" form is an opaque handle.
pub struct MemoryKms {
    keys: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Default for MemoryKms {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKms {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn data_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

#[async_trait]
impl Kms for MemoryKms {
    async fn generate_data_key(&self, key_id: &str, bytes: usize) -> SubstrateResult<DataKey> {
        let mut plaintext = vec![0u8; bytes];
        rand::thread_rng().fill_bytes(&mut plaintext);
        let ciphertext = format!("kms:{key_id}:{}", random_hex(32)).into_bytes();
        self.keys.lock().insert(ciphertext.clone(), plaintext.clone());
        Ok(DataKey { plaintext, ciphertext })
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> SubstrateResult<Vec<u8>> {
        self.keys
            .lock()
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| SubstrateError::api("InvalidCiphertextException", ""))
    }

    async fn generate_random(&self, bytes: usize) -> SubstrateResult<Vec<u8>> {
        let mut out = vec![0u8; bytes];
        rand::thread_rng().fill_bytes(&mut out);
        Ok(out)
    }
}
