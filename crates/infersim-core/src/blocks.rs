use sha2::{Digest, Sha256};

/// Derives chained 64-bit block fingerprints from a tokenized prompt.
///
/// The fingerprint of block `i` folds in the fingerprint of block `i-1`, so
/// identical token runs at different prompt offsets hash differently while
/// identical prompt prefixes always share their leading fingerprints.
pub struct BlockHasher {
    seed: String,
    block_size: usize,
}

impl BlockHasher {
    pub fn new(seed: impl Into<String>, block_size: usize) -> Self {
        Self { seed: seed.into(), block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Fingerprints for each full block of `tokens`; a trailing partial block
    /// is ignored. A prompt shorter than one block yields an empty list.
    pub fn token_blocks(&self, model: &str, tokens: &[u32]) -> Vec<u64> {
        let mut out = Vec::with_capacity(tokens.len() / self.block_size);
        let mut parent: u64 = 0;
        for chunk in tokens.chunks_exact(self.block_size) {
            let mut hasher = Sha256::new();
            hasher.update(self.seed.as_bytes());
            hasher.update([0xff]);
            hasher.update(model.as_bytes());
            hasher.update([0xff]);
            hasher.update(parent.to_be_bytes());
            for t in chunk {
                hasher.update(t.to_le_bytes());
            }
            let digest = hasher.finalize();
            let mut low = [0u8; 8];
            low.copy_from_slice(&digest[..8]);
            parent = u64::from_be_bytes(low);
            out.push(parent);
        }
        out
    }
}
