//! Replay cursor persistence.
//!
//! A cursor records the last fully fanned-out position per channel. The
//! connector resumes from it on reconnect, so the store must be durable
//! before `advance` returns and must never move backwards except through an
//! explicit operator override (`force_set`).

use crate::message::Position;
use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Persisted cursor state for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    /// Opaque upstream position token
    pub token: String,
    /// Ingestion sequence backing the monotonicity check
    pub seq: u64,
    /// Last update time, unix milliseconds
    pub updated_ms: u64,
}

impl CursorRecord {
    fn from_position(position: &Position) -> Self {
        Self {
            token: position.token.clone(),
            seq: position.seq,
            updated_ms: unix_millis(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Durable record of the last acknowledged replay position per channel
///
/// `advance` must be monotonic (a position whose sequence is not greater
/// than the stored one is ignored) and durable before returning. There is a
/// single writer per channel; implementations only need to be safe for
/// concurrent writers on distinct channels.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Get the stored cursor for a channel, if any
    async fn get(&self, channel: &str) -> BridgeResult<Option<CursorRecord>>;

    /// Advance the cursor for a channel
    ///
    /// Ignored when `position.seq` does not move the cursor forward.
    async fn advance(&self, channel: &str, position: &Position) -> BridgeResult<()>;

    /// Operator override: set the cursor unconditionally
    async fn force_set(&self, channel: &str, position: &Position) -> BridgeResult<()>;
}

/// In-memory cursor store, for tests and throwaway runs
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    records: Mutex<HashMap<String, CursorRecord>>,
}

impl MemoryCursorStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, channel: &str) -> BridgeResult<Option<CursorRecord>> {
        Ok(self.records.lock().unwrap().get(channel).cloned())
    }

    async fn advance(&self, channel: &str, position: &Position) -> BridgeResult<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(current) = records.get(channel) {
            if position.seq <= current.seq {
                debug!(
                    channel,
                    stored = current.seq,
                    offered = position.seq,
                    "Ignoring non-monotonic cursor advance"
                );
                return Ok(());
            }
        }
        records.insert(channel.to_string(), CursorRecord::from_position(position));
        Ok(())
    }

    async fn force_set(&self, channel: &str, position: &Position) -> BridgeResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(channel.to_string(), CursorRecord::from_position(position));
        Ok(())
    }
}

/// File-backed cursor store
///
/// All channels live in one JSON document. Each advance rewrites the file
/// through a temp-file-and-rename so a crash mid-write leaves the previous
/// state intact, and the file is fsynced before `advance` returns.
#[derive(Debug)]
pub struct FileCursorStore {
    path: PathBuf,
    records: Mutex<HashMap<String, CursorRecord>>,
}

impl FileCursorStore {
    /// Open a store at `path`, loading existing state if the file exists
    pub fn open(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                BridgeError::config(format!(
                    "Failed to parse cursor file {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &HashMap<String, CursorRecord>) -> BridgeResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(records)?;

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn get(&self, channel: &str) -> BridgeResult<Option<CursorRecord>> {
        Ok(self.records.lock().unwrap().get(channel).cloned())
    }

    async fn advance(&self, channel: &str, position: &Position) -> BridgeResult<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(current) = records.get(channel) {
            if position.seq <= current.seq {
                debug!(
                    channel,
                    stored = current.seq,
                    offered = position.seq,
                    "Ignoring non-monotonic cursor advance"
                );
                return Ok(());
            }
        }
        records.insert(channel.to_string(), CursorRecord::from_position(position));
        self.persist(&records)
    }

    async fn force_set(&self, channel: &str, position: &Position) -> BridgeResult<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(channel.to_string(), CursorRecord::from_position(position));
        self.persist(&records)
    }
}

/// Redis-backed cursor store
///
/// One key per channel under a configurable prefix, value is the JSON
/// cursor record. The connection is established lazily and re-established
/// after errors.
pub struct RedisCursorStore {
    client: redis::Client,
    key_prefix: String,
    connection: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisCursorStore {
    /// Create a store for the given redis URL and key prefix
    pub fn new(url: &str, key_prefix: impl Into<String>) -> BridgeResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BridgeError::config(format!("Invalid redis URL: {}", e)))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    fn key(&self, channel: &str) -> String {
        format!("{}:{}", self.key_prefix, channel)
    }

    async fn connection(
        &self,
        guard: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> BridgeResult<redis::aio::MultiplexedConnection> {
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BridgeError::transient_with_source("Redis connection failed", e))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn get(&self, channel: &str) -> BridgeResult<Option<CursorRecord>> {
        let mut guard = self.connection.lock().await;
        let mut conn = self.connection(&mut guard).await?;

        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(channel))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                *guard = None;
                BridgeError::transient_with_source("Redis GET failed", e)
            })?;

        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn advance(&self, channel: &str, position: &Position) -> BridgeResult<()> {
        // Single writer per channel, so read-compare-write is race-free here
        if let Some(current) = self.get(channel).await? {
            if position.seq <= current.seq {
                debug!(
                    channel,
                    stored = current.seq,
                    offered = position.seq,
                    "Ignoring non-monotonic cursor advance"
                );
                return Ok(());
            }
        }
        self.force_set(channel, position).await
    }

    async fn force_set(&self, channel: &str, position: &Position) -> BridgeResult<()> {
        let record = serde_json::to_string(&CursorRecord::from_position(position))?;

        let mut guard = self.connection.lock().await;
        let mut conn = self.connection(&mut guard).await?;

        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(self.key(channel))
            .arg(record)
            .query_async(&mut conn)
            .await;

        result.map_err(|e| {
            *guard = None;
            BridgeError::transient_with_source("Redis SET failed", e)
        })
    }
}
