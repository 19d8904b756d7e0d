//! Key management: data keys and randomness.

use async_trait::async_trait;

use crate::error::SubstrateResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKey {
    pub plaintext: Vec<u8>,
    /// Opaque handle only the KMS can turn back into `plaintext`.
    pub ciphertext: Vec<u8>,
}

#[async_trait]
pub trait Kms: Send + Sync {
    async fn generate_data_key(&self, key_id: &str, bytes: usize) -> SubstrateResult<DataKey>;

    /// Unknown handles fail with `InvalidCiphertextException`.
    async fn decrypt(&self, ciphertext: &[u8]) -> SubstrateResult<Vec<u8>>;

    async fn generate_random(&self, bytes: usize) -> SubstrateResult<Vec<u8>>;
}
