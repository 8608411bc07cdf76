//! Chunked buffer for payloads crossing a size-limited channel.
//!
//! Producers `store()` a whole buffer and hand out the returned
//! [`StreamTicket`]; consumers pull it back one bounded chunk at a time.
//! Every entry is deleted after a fixed safety TTL whether or not anyone
//! drained it, so a stalled consumer cannot pin memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use mu_proto::protocol::{ChunkEncoding, StreamTicket};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("unknown stream {0}")]
    UnknownStream(String),
    #[error("chunk {index} out of range for stream {id} ({count} chunks)")]
    OutOfRange { id: String, index: u32, count: u32 },
    #[error("chunk {index} of stream {id} is empty")]
    EmptyChunk { id: String, index: u32 },
}

/// One chunk in the requested encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Zero-copy view into the stored buffer.
    Raw(Bytes),
    /// Text-safe fallback.
    Base64(String),
}

struct StreamEntry {
    raw: Bytes,
    chunk_count: u32,
    content_type: String,
    metadata: HashMap<String, String>,
    created_at: Instant,
}

struct Inner {
    chunk_size: usize,
    safety_ttl: Duration,
    entries: Mutex<HashMap<String, StreamEntry>>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle to the shared store.
#[derive(Clone)]
pub struct StreamStore {
    inner: Arc<Inner>,
}

impl StreamStore {
    pub fn new(chunk_size: usize, safety_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                chunk_size: chunk_size.max(1),
                safety_ttl,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Buffer `raw` and schedule its unconditional deletion.
    pub fn store(
        &self,
        raw: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> StreamTicket {
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("s{}-{:08x}", seq, rand::random::<u32>());
        let chunk_count = raw.len().div_ceil(self.inner.chunk_size) as u32;
        let ticket = StreamTicket {
            id: id.clone(),
            chunk_count,
            total_length: raw.len() as u64,
            content_type: content_type.to_string(),
        };

        let now = Instant::now();
        {
            let mut entries = self.lock();
            let ttl = self.inner.safety_ttl;
            entries.retain(|_, e| now.duration_since(e.created_at) < ttl);
            entries.insert(
                id.clone(),
                StreamEntry {
                    raw,
                    chunk_count,
                    content_type: content_type.to_string(),
                    metadata,
                    created_at: now,
                },
            );
        }
        debug!(
            "stream store: {} stored ({} bytes, {} chunks)",
            id, ticket.total_length, chunk_count
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let ttl = self.inner.safety_ttl;
                handle.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    if let Some(inner) = weak.upgrade() {
                        let store = StreamStore { inner };
                        if store.delete(&id) {
                            debug!("stream store: {} expired undrained", id);
                        }
                    }
                });
            }
            Err(_) => warn!("stream store: no runtime, {} relies on sweep", ticket.id),
        }
        ticket
    }

    /// Byte range `[index*C, min(len, (index+1)*C))` as a zero-copy slice.
    pub fn get_chunk(&self, id: &str, index: u32) -> Result<Bytes, StreamError> {
        let entries = self.lock();
        let entry = entries
            .get(id)
            .ok_or_else(|| StreamError::UnknownStream(id.to_string()))?;
        if index >= entry.chunk_count {
            return Err(StreamError::OutOfRange {
                id: id.to_string(),
                index,
                count: entry.chunk_count,
            });
        }
        let start = index as usize * self.inner.chunk_size;
        let end = (start + self.inner.chunk_size).min(entry.raw.len());
        if start >= end {
            return Err(StreamError::EmptyChunk {
                id: id.to_string(),
                index,
            });
        }
        Ok(entry.raw.slice(start..end))
    }

    pub fn get_chunk_as(
        &self,
        id: &str,
        index: u32,
        encoding: ChunkEncoding,
    ) -> Result<ChunkPayload, StreamError> {
        let chunk = self.get_chunk(id, index)?;
        Ok(match encoding {
            ChunkEncoding::Raw => ChunkPayload::Raw(chunk),
            ChunkEncoding::Base64 => ChunkPayload::Base64(STANDARD.encode(&chunk)),
        })
    }

    /// Content type and caller metadata recorded at `store()` time.
    pub fn describe(&self, id: &str) -> Option<(String, HashMap<String, String>)> {
        self.lock()
            .get(id)
            .map(|e| (e.content_type.clone(), e.metadata.clone()))
    }

    /// Early release.  Returns whether the entry was still present.
    pub fn delete(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamEntry>> {
        // A poisoned map is still structurally valid.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Anything a consumer can pull chunks from.
#[async_trait]
pub trait ChunkSource: Send {
    async fn raw_chunk(&mut self, id: &str, index: u32) -> anyhow::Result<Bytes>;
    async fn encoded_chunk(&mut self, id: &str, index: u32) -> anyhow::Result<String>;
}

#[async_trait]
impl ChunkSource for StreamStore {
    async fn raw_chunk(&mut self, id: &str, index: u32) -> anyhow::Result<Bytes> {
        Ok(self.get_chunk(id, index)?)
    }

    async fn encoded_chunk(&mut self, id: &str, index: u32) -> anyhow::Result<String> {
        match self.get_chunk_as(id, index, ChunkEncoding::Base64)? {
            ChunkPayload::Base64(s) => Ok(s),
            ChunkPayload::Raw(b) => Ok(STANDARD.encode(&b)),
        }
    }
}

/// Reassemble a whole stream, preferring raw chunks and falling back to the
/// base64 encoding per chunk when the raw path fails.
pub async fn pull_stream<S: ChunkSource + ?Sized>(
    source: &mut S,
    ticket: &StreamTicket,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ticket.total_length as usize);
    for index in 0..ticket.chunk_count {
        match source.raw_chunk(&ticket.id, index).await {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(e) => {
                debug!(
                    "pull {}#{}: raw failed ({}), using base64",
                    ticket.id, index, e
                );
                let text = source.encoded_chunk(&ticket.id, index).await?;
                out.extend_from_slice(&STANDARD.decode(text.as_bytes())?);
            }
        }
    }
    if out.len() as u64 != ticket.total_length {
        anyhow::bail!(
            "stream {} reassembled to {} bytes, expected {}",
            ticket.id,
            out.len(),
            ticket.total_length
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(chunk: usize) -> StreamStore {
        StreamStore::new(chunk, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_chunk_lengths_partition_buffer() {
        let store = store_with(4);
        let ticket = store.store(Bytes::from_static(b"0123456789"), "image/png", HashMap::new());
        assert_eq!(ticket.chunk_count, 3);
        assert_eq!(ticket.total_length, 10);

        let lens: Vec<usize> = (0..3)
            .map(|i| store.get_chunk(&ticket.id, i).unwrap().len())
            .collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert_eq!(&store.get_chunk(&ticket.id, 2).unwrap()[..], b"89");
    }

    #[tokio::test]
    async fn test_chunks_concatenate_exactly() {
        for (len, chunk) in [(1usize, 1usize), (7, 3), (64, 8), (65, 8), (1000, 999)] {
            let store = store_with(chunk);
            let raw: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let ticket = store.store(Bytes::from(raw.clone()), "x", HashMap::new());
            assert_eq!(ticket.chunk_count as usize, len.div_ceil(chunk));
            let mut joined = Vec::new();
            for i in 0..ticket.chunk_count {
                joined.extend_from_slice(&store.get_chunk(&ticket.id, i).unwrap());
            }
            assert_eq!(joined, raw);
        }
    }

    #[tokio::test]
    async fn test_out_of_range_and_unknown() {
        let store = store_with(4);
        let ticket = store.store(Bytes::from_static(b"abcdef"), "x", HashMap::new());
        assert!(matches!(
            store.get_chunk(&ticket.id, 2),
            Err(StreamError::OutOfRange { count: 2, .. })
        ));
        assert!(matches!(
            store.get_chunk("nope", 0),
            Err(StreamError::UnknownStream(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_buffer_has_no_chunks() {
        let store = store_with(4);
        let ticket = store.store(Bytes::new(), "x", HashMap::new());
        assert_eq!(ticket.chunk_count, 0);
        assert!(store.get_chunk(&ticket.id, 0).is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_final() {
        let store = store_with(4);
        let ticket = store.store(Bytes::from_static(b"abcdef"), "x", HashMap::new());
        assert!(store.delete(&ticket.id));
        assert!(!store.delete(&ticket.id));
        assert!(store.get_chunk(&ticket.id, 0).is_err());
    }

    #[tokio::test]
    async fn test_base64_matches_raw() {
        let store = store_with(5);
        let ticket = store.store(Bytes::from_static(b"\x00\xffhello world"), "x", HashMap::new());
        for i in 0..ticket.chunk_count {
            let raw = store.get_chunk(&ticket.id, i).unwrap();
            match store.get_chunk_as(&ticket.id, i, ChunkEncoding::Base64).unwrap() {
                ChunkPayload::Base64(text) => assert_eq!(STANDARD.decode(text).unwrap(), raw),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_ttl_deletes_undrained_entry() {
        let store = StreamStore::new(4, Duration::from_secs(30));
        let ticket = store.store(Bytes::from_static(b"abcdef"), "x", HashMap::new());
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(store.get_chunk(&ticket.id, 0).is_ok());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get_chunk(&ticket.id, 0).is_err());
        assert!(store.is_empty());
    }

    /// Raw path fails for every odd chunk.
    struct Flaky(StreamStore);

    #[async_trait]
    impl ChunkSource for Flaky {
        async fn raw_chunk(&mut self, id: &str, index: u32) -> anyhow::Result<Bytes> {
            if index % 2 == 1 {
                anyhow::bail!("message too large");
            }
            self.0.raw_chunk(id, index).await
        }

        async fn encoded_chunk(&mut self, id: &str, index: u32) -> anyhow::Result<String> {
            self.0.encoded_chunk(id, index).await
        }
    }

    #[tokio::test]
    async fn test_pull_falls_back_to_base64() {
        let store = store_with(3);
        let raw: Vec<u8> = (0u8..20).collect();
        let ticket = store.store(Bytes::from(raw.clone()), "x", HashMap::new());
        let mut flaky = Flaky(store.clone());
        assert_eq!(pull_stream(&mut flaky, &ticket).await.unwrap(), raw);
    }

    #[tokio::test]
    async fn test_describe_keeps_metadata() {
        let store = store_with(3);
        let mut meta = HashMap::new();
        meta.insert("model".to_string(), "manga:1600p x2 balanced".to_string());
        let ticket = store.store(Bytes::from_static(b"abc"), "image/png", meta);
        let (ct, meta) = store.describe(&ticket.id).unwrap();
        assert_eq!(ct, "image/png");
        assert_eq!(meta["model"], "manga:1600p x2 balanced");
    }
}
