use infersim_common::{Result, SimError};

/// Produces the ordered token ids for a prompt. Implementations must be pure:
/// the same text always maps to the same ids.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;
}

/// HuggingFace `tokenizer.json` backed implementation.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| SimError::Tokenizer(format!("load {}: {}", path, e)))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| SimError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;

    /// Byte-level stand-in used when no tokenizer file is configured.
    #[derive(Default)]
    pub struct ByteTokenizer;

    impl ByteTokenizer {
        pub fn new() -> Self {
            Self
        }
    }

    impl Tokenizer for ByteTokenizer {
        fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.as_bytes().iter().map(|b| *b as u32).collect())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn byte_tokenizer_is_pure() {
            let t = ByteTokenizer::new();
            assert_eq!(t.tokenize("abc").unwrap(), t.tokenize("abc").unwrap());
            assert_eq!(t.tokenize("abc").unwrap().len(), 3);
        }
    }
}
