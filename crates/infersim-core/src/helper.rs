use std::sync::{Arc, Mutex};

use infersim_common::config::SimConfig;
use infersim_common::Result;
use infersim_tokenizer::Tokenizer;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::blocks::BlockHasher;
use crate::cache::{BlockCache, CacheStats};
use crate::publisher::ZmqPublisher;
use crate::sender::{event_topic, EventSender};

/// Token accounting returned to the HTTP layer when a request is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptAccounting {
    pub prompt_tokens: usize,
    /// Number of prompt tokens whose blocks were already resident.
    pub cached_prompt_tokens: usize,
}

/// Façade the HTTP layer talks to: tokenize, derive block fingerprints, drive
/// the block cache, and report cached-prompt-token counts.
pub struct KvCacheHelper {
    cache: Arc<BlockCache>,
    tokenizer: Arc<dyn Tokenizer>,
    hasher: BlockHasher,
    model: String,
    sender: Mutex<Option<EventSender>>,
}

impl KvCacheHelper {
    /// Wires the cache, the event channel and the ZMQ publisher from config.
    /// An empty endpoint, or a publisher that cannot connect, degrades to a
    /// cache with events disabled rather than failing startup.
    pub async fn new(
        config: &SimConfig,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<(Self, watch::Receiver<f64>)> {
        let mut sender = None;
        let mut events_tx = None;
        if !config.zmq_endpoint.is_empty() {
            match ZmqPublisher::connect(&config.zmq_endpoint, config.zmq_max_connect_attempts).await
            {
                Ok(publisher) => {
                    let (tx, rx) = mpsc::channel(config.event_channel_size);
                    sender = Some(EventSender::new(
                        rx,
                        Box::new(publisher),
                        event_topic(config.port, &config.model),
                        config.event_batch_size,
                    ));
                    events_tx = Some(tx);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "kv_cache",
                        endpoint = %config.zmq_endpoint,
                        "kv events disabled: {}",
                        e
                    );
                }
            }
        }
        let (cache, usage_rx) = BlockCache::new(config.kv_cache_size, events_tx);
        let helper = Self {
            cache: Arc::new(cache),
            tokenizer,
            hasher: BlockHasher::new(config.effective_hash_seed(), config.token_block_size),
            model: config.model.clone(),
            sender: Mutex::new(sender),
        };
        Ok((helper, usage_rx))
    }

    /// Admits a request's prompt into the cache. Tokenizer and cache errors
    /// propagate unchanged; a capacity error leaves the cache untouched.
    pub fn on_request_start(&self, request_id: &str, prompt: &str) -> Result<PromptAccounting> {
        let tokens = self.tokenizer.tokenize(prompt)?;
        let blocks = self.hasher.token_blocks(&self.model, &tokens);
        let cached_blocks = self.cache.start_request(request_id, &blocks)?;
        Ok(PromptAccounting {
            prompt_tokens: tokens.len(),
            cached_prompt_tokens: cached_blocks * self.hasher.block_size(),
        })
    }

    pub fn on_request_end(&self, request_id: &str) -> Result<()> {
        self.cache.finish_request(request_id)
    }

    /// Drives the event sender until cancellation. With events disabled this
    /// just waits for the token so callers get uniform lifecycle handling.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let sender = {
            let mut guard = self.sender.lock().unwrap();
            guard.take()
        };
        match sender {
            Some(sender) => sender.run(cancel).await,
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
