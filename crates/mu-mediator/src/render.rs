//! Fallback render pipeline.
//!
//! A result is applied with progressively more invasive strategies:
//! reference swap, then an embedded self-contained copy, then an overlay
//! composited over the untouched original.  Display sides implement
//! [`Surface`]; [`RemoteSurface`] turns every step into a
//! [`RenderInstruction`] for a connected consumer.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use mu_proto::params::OutputFormat;
use mu_proto::protocol::{ItemId, RenderInstruction, StreamTicket, SwapStrategy};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::Enhanced;
use crate::stream_store::StreamStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// The display side refused this strategy.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// An image the display side managed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Reference,
    Embedded,
    Overlay,
    /// Overlay built from a re-request in a more portable format.
    OverlayAlternate,
}

pub trait Surface: Send {
    fn swap(
        &mut self,
        item: ItemId,
        strategy: SwapStrategy,
        payload: &Enhanced,
    ) -> Result<(), RenderError>;

    fn decode(&mut self, bytes: &Bytes, content_type: &str) -> Result<Decoded, RenderError>;

    fn place_overlay(&mut self, item: ItemId, image: &Decoded) -> Result<(), RenderError>;

    /// Revert to the original display.  Must be idempotent.
    fn restore(&mut self, item: ItemId);

    fn show_processing(&mut self, item: ItemId);

    fn clear_overlays(&mut self, item: ItemId);

    fn prefetch_original(&mut self, item: ItemId, locator: &str);

    fn hint_eager_load(&mut self, item: ItemId);
}

/// Known image signatures: (offset, magic, content type).
const SIGNATURES: &[(usize, &[u8], &str)] = &[
    (0, b"\x89PNG\r\n\x1a\n", "image/png"),
    (0, b"\xff\xd8\xff", "image/jpeg"),
    (0, b"GIF87a", "image/gif"),
    (0, b"GIF89a", "image/gif"),
    (8, b"WEBP", "image/webp"),
    (8, b"avif", "image/avif"),
    (8, b"avis", "image/avif"),
    (0, b"BM", "image/bmp"),
];

/// Content type from the leading bytes, if the format is supported.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    SIGNATURES.iter().find_map(|(offset, magic, ct)| {
        let hit = bytes.get(*offset..offset + magic.len()) == Some(*magic);
        // WebP and AVIF also need their container header.
        let container = match *ct {
            "image/webp" => bytes.starts_with(b"RIFF"),
            "image/avif" => bytes.get(4..8) == Some(&b"ftyp"[..]),
            _ => true,
        };
        (hit && container).then_some(*ct)
    })
}

/// `image/jpg` and parameters are common in the wild.
pub fn normalize_content_type(ct: &str) -> String {
    let base = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => base,
    }
}

pub fn data_uri(payload: &Enhanced) -> String {
    format!(
        "data:{};base64,{}",
        normalize_content_type(&payload.content_type),
        STANDARD.encode(&payload.bytes)
    )
}

/// Primary decode with the declared type, then a second attempt with the
/// sniffed type.  Failing both is terminal.
pub fn decode<S: Surface + ?Sized>(surface: &mut S, payload: &Enhanced) -> Result<Decoded, RenderError> {
    let primary = match surface.decode(&payload.bytes, &payload.content_type) {
        Ok(decoded) => return Ok(decoded),
        Err(e) => e,
    };
    let Some(sniffed) = sniff_content_type(&payload.bytes) else {
        return Err(RenderError::Decode(format!("{}; unknown signature", primary)));
    };
    debug!("decode: declared {} failed, retrying as {}", payload.content_type, sniffed);
    surface
        .decode(&payload.bytes, sniffed)
        .map_err(|e| RenderError::Decode(format!("{}; sniffed {}: {}", primary, sniffed, e)))
}

/// Apply an enhancement result to `item`.  `refetch` re-requests the result
/// in another output format; it is used at most once, after a decode
/// failure.
pub async fn apply_result<S, F, Fut>(
    surface: &mut S,
    item: ItemId,
    payload: &Enhanced,
    format: OutputFormat,
    refetch: F,
) -> Result<RenderOutcome, RenderError>
where
    S: Surface + ?Sized,
    F: FnOnce(OutputFormat) -> Fut,
    Fut: Future<Output = Option<Enhanced>>,
{
    match surface.swap(item, SwapStrategy::Reference, payload) {
        Ok(()) => return Ok(RenderOutcome::Reference),
        Err(e) => debug!("item {}: reference swap failed: {}", item, e),
    }
    surface.restore(item);

    match surface.swap(item, SwapStrategy::Embedded, payload) {
        Ok(()) => return Ok(RenderOutcome::Embedded),
        Err(e) => debug!("item {}: embedded swap failed: {}", item, e),
    }
    surface.restore(item);

    match decode(surface, payload) {
        Ok(image) => {
            surface.place_overlay(item, &image)?;
            Ok(RenderOutcome::Overlay)
        }
        Err(RenderError::Decode(reason)) => {
            let alternate = format.fallback();
            warn!(
                "item {}: {}; re-requesting as {}",
                item,
                reason,
                alternate.as_str()
            );
            let Some(second) = refetch(alternate).await else {
                return Err(RenderError::Decode(reason));
            };
            let image = decode(surface, &second)?;
            surface.place_overlay(item, &image)?;
            Ok(RenderOutcome::OverlayAlternate)
        }
        Err(e) => Err(e),
    }
}

/// Limits a remote consumer puts on the strategies it accepts.
#[derive(Debug, Clone, Copy)]
pub struct SurfacePolicy {
    pub allow_reference: bool,
    /// Largest payload worth inlining as a data URI.
    pub embedded_max_bytes: usize,
}

impl Default for SurfacePolicy {
    fn default() -> Self {
        Self {
            allow_reference: true,
            embedded_max_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Surface for a consumer on the socket: each accepted step becomes a
/// render instruction, payload bytes go through the stream store.
pub struct RemoteSurface {
    store: StreamStore,
    policy: SurfacePolicy,
    outbox: Vec<RenderInstruction>,
    displaced: HashSet<ItemId>,
}

impl RemoteSurface {
    pub fn new(store: StreamStore, policy: SurfacePolicy) -> Self {
        Self {
            store,
            policy,
            outbox: Vec::new(),
            displaced: HashSet::new(),
        }
    }

    /// Drain pending instructions in the order they were produced.
    pub fn take_outbox(&mut self) -> Vec<RenderInstruction> {
        std::mem::take(&mut self.outbox)
    }

    pub fn is_displaced(&self, item: ItemId) -> bool {
        self.displaced.contains(&item)
    }

    fn stash(&self, item: ItemId, bytes: &Bytes, content_type: &str, model: &str) -> StreamTicket {
        let mut meta = HashMap::new();
        meta.insert("item".to_string(), item.to_string());
        meta.insert("model".to_string(), model.to_string());
        self.store.store(bytes.clone(), content_type, meta)
    }
}

impl Surface for RemoteSurface {
    fn swap(
        &mut self,
        item: ItemId,
        strategy: SwapStrategy,
        payload: &Enhanced,
    ) -> Result<(), RenderError> {
        match strategy {
            SwapStrategy::Reference if !self.policy.allow_reference => {
                return Err(RenderError::Rejected("reference swaps disabled".to_string()));
            }
            SwapStrategy::Embedded if payload.bytes.len() > self.policy.embedded_max_bytes => {
                return Err(RenderError::Rejected(format!(
                    "{} bytes exceeds the inline limit",
                    payload.bytes.len()
                )));
            }
            _ => {}
        }
        let content_type = normalize_content_type(&payload.content_type);
        let stream = self.stash(item, &payload.bytes, &content_type, &payload.model);
        self.outbox.push(RenderInstruction::Swap {
            item,
            strategy,
            stream,
        });
        self.displaced.insert(item);
        Ok(())
    }

    fn decode(&mut self, bytes: &Bytes, content_type: &str) -> Result<Decoded, RenderError> {
        let declared = normalize_content_type(content_type);
        match sniff_content_type(bytes) {
            Some(actual) if actual == declared => Ok(Decoded {
                bytes: bytes.clone(),
                content_type: declared,
            }),
            Some(actual) => Err(RenderError::Decode(format!(
                "declared {} but data is {}",
                declared, actual
            ))),
            None => Err(RenderError::Decode(format!("not a {} image", declared))),
        }
    }

    fn place_overlay(&mut self, item: ItemId, image: &Decoded) -> Result<(), RenderError> {
        let stream = self.stash(item, &image.bytes, &image.content_type, "");
        self.outbox.push(RenderInstruction::Overlay { item, stream });
        self.displaced.insert(item);
        Ok(())
    }

    fn restore(&mut self, item: ItemId) {
        if self.displaced.remove(&item) {
            self.outbox.push(RenderInstruction::Restore { item });
        }
    }

    fn show_processing(&mut self, item: ItemId) {
        self.outbox.push(RenderInstruction::ShowProcessing { item });
    }

    fn clear_overlays(&mut self, item: ItemId) {
        self.outbox.push(RenderInstruction::ClearOverlays { item });
    }

    fn prefetch_original(&mut self, item: ItemId, locator: &str) {
        self.outbox.push(RenderInstruction::PrefetchOriginal {
            item,
            locator: locator.to_string(),
        });
    }

    fn hint_eager_load(&mut self, item: ItemId) {
        self.outbox.push(RenderInstruction::EagerLoad { item });
    }
}
