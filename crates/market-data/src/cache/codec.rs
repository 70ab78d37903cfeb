use super::CacheError;

/// Transformation applied to serialized values before they are stored.
///
/// The checksum is taken over the encoded bytes, so a codec that compresses or
/// encrypts is covered by the integrity check without knowing about it.
pub trait EntryCodec: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, CacheError>;

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError>;
}

/// Stores serialized values as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityCodec;

impl EntryCodec for IdentityCodec {
    fn name(&self) -> &str {
        "identity"
    }

    fn encode(&self, plain: Vec<u8>) -> Result<Vec<u8>, CacheError> {
        Ok(plain)
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(stored.to_vec())
    }
}
