use infersim_common::{Result, SimError};
use rmpv::Value;

/// A block-cache notification, emitted by the cache while its lock is held
/// and drained by the event sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Stored(Vec<u64>),
    Removed(Vec<u64>),
}

impl KvEvent {
    /// Tagged-array shape of the event. `BlockStored` reserves slots for
    /// parent_block_hash, token_ids, block_size and lora_id, which this
    /// simulator never populates.
    pub fn to_value(&self) -> Value {
        match self {
            KvEvent::Stored(hashes) => Value::Array(vec![
                Value::from("BlockStored"),
                hashes_value(hashes),
                Value::Nil,
                Value::Nil,
                Value::Nil,
                Value::Nil,
            ]),
            KvEvent::Removed(hashes) => {
                Value::Array(vec![Value::from("BlockRemoved"), hashes_value(hashes)])
            }
        }
    }

    /// Standalone msgpack encoding of one event. Batches embed these raw
    /// buffers, so a consumer decodes the batch once and then each event
    /// again individually.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())
            .map_err(|e| SimError::Publisher(format!("encode event: {}", e)))?;
        Ok(buf)
    }
}

fn hashes_value(hashes: &[u64]) -> Value {
    Value::Array(hashes.iter().map(|h| Value::from(*h)).collect())
}

/// One published pub/sub payload: a timestamped group of individually
/// pre-encoded events.
pub struct EventBatch {
    pub ts: f64,
    pub events: Vec<Vec<u8>>,
    pub data_parallel_rank: Option<i64>,
}

impl EventBatch {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let rank = match self.data_parallel_rank {
            Some(rank) => Value::from(rank),
            None => Value::Nil,
        };
        let events = self
            .events
            .iter()
            .map(|raw| Value::Binary(raw.clone()))
            .collect();
        let value = Value::Map(vec![
            (Value::from("ts"), Value::F64(self.ts)),
            (Value::from("events"), Value::Array(events)),
            (Value::from("data_parallel_rank"), rank),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .map_err(|e| SimError::Publisher(format!("encode batch: {}", e)))?;
        Ok(buf)
    }
}

/// Unix time in seconds at nanosecond resolution.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
