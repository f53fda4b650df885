pub type Result<T> = core::result::Result<T, SimError>;

#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("request {0} is already registered")]
    DuplicateRequest(String),
    #[error("kv cache capacity exceeded: need {requested} blocks, capacity {capacity}")]
    KvCacheCapacity { requested: usize, capacity: usize },
    #[error("kv cache consistency: blocks missing from in-use set: {0:?}")]
    CacheConsistency(Vec<u64>),
    #[error("tokenizer: {0}")]
    Tokenizer(String),
    #[error("publisher: {0}")]
    Publisher(String),
    #[error("{0}")]
    Message(String),
}

pub mod config {
    use serde::Deserialize;
    use std::env;

    use crate::{Result, SimError};

    pub const BLOCK_SIZES: [usize; 5] = [8, 16, 32, 64, 128];

    #[derive(Debug, Clone, Deserialize)]
    pub struct LoraModule {
        pub name: String,
        #[serde(default)]
        pub path: Option<String>,
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct SimConfig {
        pub port: u16,
        pub model: String,
        pub served_model_names: Vec<String>,
        pub mode: String,
        pub max_loras: usize,
        pub lora_modules: Vec<LoraModule>,
        pub max_model_len: usize,
        pub time_to_first_token_ms: u64,
        pub inter_token_latency_ms: u64,
        pub kv_cache_size: usize,
        pub token_block_size: usize,
        pub hash_seed: String,
        pub event_batch_size: usize,
        pub event_channel_size: usize,
        pub zmq_endpoint: String,
        pub zmq_max_connect_attempts: u64,
        pub tokenizer_path: Option<String>,
    }

    impl Default for SimConfig {
        fn default() -> Self {
            Self {
                port: 8000,
                model: "Qwen/Qwen2-0.5B".to_string(),
                served_model_names: Vec::new(),
                mode: "random".to_string(),
                max_loras: 1,
                lora_modules: Vec::new(),
                max_model_len: 1024,
                time_to_first_token_ms: 0,
                inter_token_latency_ms: 0,
                kv_cache_size: 1024,
                token_block_size: 16,
                hash_seed: String::new(),
                event_batch_size: 16,
                event_channel_size: 10_000,
                zmq_endpoint: String::new(),
                zmq_max_connect_attempts: 10,
                tokenizer_path: None,
            }
        }
    }

    impl SimConfig {
        pub fn load() -> Self {
            let mut cfg = if let Ok(path) = env::var("INFERSIM_CONFIG") {
                let Ok(text) = std::fs::read_to_string(&path) else { return Self::default() };
                let Ok(cfg) = serde_yaml::from_str::<SimConfig>(&text) else { return Self::default() };
                cfg
            } else {
                Self::default()
            };
            if let Ok(v) = env::var("INFERSIM_MODEL") {
                cfg.model = v;
            }
            if let Ok(v) = env::var("INFERSIM_MODE") {
                cfg.mode = v;
            }
            if let Ok(v) = env::var("INFERSIM_HASH_SEED") {
                cfg.hash_seed = v;
            }
            if let Ok(v) = env::var("INFERSIM_ZMQ_ENDPOINT") {
                cfg.zmq_endpoint = v;
            }
            if let Ok(v) = env::var("INFERSIM_TOKENIZER_PATH") {
                cfg.tokenizer_path = Some(v);
            }
            if let Some(v) = parse_env("INFERSIM_PORT") {
                cfg.port = v;
            }
            if let Some(v) = parse_env("INFERSIM_KV_CACHE_SIZE") {
                cfg.kv_cache_size = v;
            }
            if let Some(v) = parse_env("INFERSIM_TOKEN_BLOCK_SIZE") {
                cfg.token_block_size = v;
            }
            if let Some(v) = parse_env("INFERSIM_EVENT_BATCH_SIZE") {
                cfg.event_batch_size = v;
            }
            if let Some(v) = parse_env("INFERSIM_TTFT_MS") {
                cfg.time_to_first_token_ms = v;
            }
            if let Some(v) = parse_env("INFERSIM_ITL_MS") {
                cfg.inter_token_latency_ms = v;
            }
            cfg
        }

        /// Hash seed for block fingerprints; an empty seed falls back to the
        /// environment the way the simulated stack does.
        pub fn effective_hash_seed(&self) -> String {
            if self.hash_seed.is_empty() {
                env::var("PYTHONHASHSEED").unwrap_or_default()
            } else {
                self.hash_seed.clone()
            }
        }

        pub fn validate(&self) -> Result<()> {
            if !BLOCK_SIZES.contains(&self.token_block_size) {
                return Err(SimError::Config(format!(
                    "token_block_size must be one of {:?}, got {}",
                    BLOCK_SIZES, self.token_block_size
                )));
            }
            if self.kv_cache_size == 0 {
                return Err(SimError::Config("kv_cache_size must be >= 1".into()));
            }
            if self.mode != "echo" && self.mode != "random" {
                return Err(SimError::Config(format!(
                    "mode must be \"echo\" or \"random\", got {:?}",
                    self.mode
                )));
            }
            if self.event_batch_size == 0 {
                return Err(SimError::Config("event_batch_size must be >= 1".into()));
            }
            Ok(())
        }
    }

    fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
        env::var(key).ok().and_then(|v| v.parse().ok())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_are_valid() {
            SimConfig::default().validate().expect("default config");
        }

        #[test]
        fn rejects_bad_block_size() {
            let cfg = SimConfig { token_block_size: 24, ..SimConfig::default() };
            assert!(cfg.validate().is_err());
        }

        #[test]
        fn rejects_unknown_mode() {
            let cfg = SimConfig { mode: "verbatim".to_string(), ..SimConfig::default() };
            assert!(cfg.validate().is_err());
        }
    }
}
