//! KV-cache simulation core: block fingerprint derivation, the
//! reference-counted block cache, and the batched event publisher.

pub mod blocks;
pub mod cache;
pub mod events;
pub mod helper;
pub mod publisher;
pub mod sender;

pub use blocks::BlockHasher;
pub use cache::{BlockCache, CacheStats};
pub use events::{EventBatch, KvEvent};
pub use helper::{KvCacheHelper, PromptAccounting};
pub use publisher::{Publisher, ZmqPublisher};
pub use sender::{event_topic, EventSender};
