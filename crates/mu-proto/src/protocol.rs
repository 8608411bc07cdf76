use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::params::Settings;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Consumers check this on connect and can refuse to talk to
/// an incompatible mediator.
pub const PROTOCOL_VERSION: u32 = 1;

/// Consumer-assigned identity of one content item within its document.
pub type ItemId = u64;

/// Axis-aligned rectangle in document coordinates (CSS pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn intersection_area(&self, other: &Rect) -> f64 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }
}

/// The visible window onto the document, in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            scroll_x: 0.0,
            scroll_y: 0.0,
            width: 1000.0,
            height: 1000.0,
        }
    }
}

impl Viewport {
    pub fn rect(&self) -> Rect {
        Rect {
            x: self.scroll_x,
            y: self.scroll_y,
            width: self.width,
            height: self.height,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        self.rect().center()
    }
}

/// Observed state of one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: ItemId,
    /// Position in document flow order.
    pub order: u32,
    pub rect: Rect,
    /// Raw attributes the source locator is resolved from.
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default = "default_connected")]
    pub connected: bool,
}

fn default_connected() -> bool {
    true
}

/// One entry of a batched intersection-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntersectionChange {
    pub id: ItemId,
    /// Visible area of the item inside the viewport, in square pixels.
    pub area: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkEncoding {
    /// Raw bytes written straight after the `ChunkRaw` header frame.
    Raw,
    /// Standard base64 inside the JSON frame.
    Base64,
}

/// Handle to a buffered payload in the mediator's stream store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTicket {
    pub id: String,
    pub chunk_count: u32,
    pub total_length: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapStrategy {
    /// Point the element at the payload directly.
    Reference,
    /// Inline a self-contained data URI built from the payload.
    Embedded,
}

/// A display change the consumer must perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RenderInstruction {
    Swap {
        item: ItemId,
        strategy: SwapStrategy,
        stream: StreamTicket,
    },
    Overlay {
        item: ItemId,
        stream: StreamTicket,
    },
    Restore {
        item: ItemId,
    },
    ShowProcessing {
        item: ItemId,
    },
    ClearOverlays {
        item: ItemId,
    },
    PrefetchOriginal {
        item: ItemId,
        locator: String,
    },
    EagerLoad {
        item: ItemId,
    },
}

/// Counts for the current neighbourhood (current item + next candidates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusReport {
    pub target: usize,
    pub enhanced: usize,
    pub cached: usize,
    pub prefetched: usize,
}

/// Messages sent from a consumer to the mediator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Hello {
        site: String,
        #[serde(default)]
        auto_mode: bool,
    },
    Observe {
        viewport: Viewport,
        #[serde(default)]
        items: Vec<ItemSnapshot>,
        #[serde(default)]
        removed: Vec<ItemId>,
        #[serde(default)]
        intersections: Vec<IntersectionChange>,
    },
    ProcessCurrentVisible,
    RunWithPreload {
        count: usize,
    },
    GetStatus,
    SettingsChanged {
        settings: Settings,
    },
    GetChunk {
        stream_id: String,
        index: u32,
        encoding: ChunkEncoding,
    },
    ReleaseStream {
        stream_id: String,
    },
    /// The consumer gave up on the result stream for `item`.
    StreamFailed {
        item: ItemId,
        stream_id: String,
        reason: String,
    },
    ClearBackendCache,
    DownloadModels {
        #[serde(default)]
        extra_tier: bool,
    },
}

/// Messages sent from the mediator to a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect.
    Hello {
        protocol_version: u32,
        consumer_id: u64,
    },
    Status {
        status: StatusReport,
    },
    Render {
        instruction: RenderInstruction,
    },
    /// Base64 chunk body.
    Chunk {
        stream_id: String,
        index: u32,
        data: String,
    },
    /// Header for a raw chunk; exactly `len` raw bytes follow this frame.
    ChunkRaw {
        stream_id: String,
        index: u32,
        len: u32,
    },
    /// A `GetChunk` request failed; nothing follows.
    ChunkError {
        stream_id: String,
        index: u32,
        encoding: ChunkEncoding,
        message: String,
    },
    /// At most one per cooldown episode.
    Notice {
        message: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Upper bound on one consumer frame; observations may carry inline sources.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads a big-endian length header; errors on frames above `MAX_FRAME_LEN`.
pub fn frame_len(header: [u8; 4]) -> anyhow::Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame too large: {} bytes", len);
    }
    Ok(len)
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = frame_len([data[0], data[1], data[2], data[3]])?;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
