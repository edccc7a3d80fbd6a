//! Hwcomp IPC Protocol
//!
//! Shared message types for communication between scene producers and the
//! `hwcomp` plane scheduler service.

pub mod wire;
use serde::{Deserialize, Serialize};

/// Socket path for IPC communication
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join("hwcomp.sock")
}

// ============================================================================
// Producer → Scheduler Messages
// ============================================================================

/// Messages sent from a scene producer to the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProducerMessage {
    /// Make a buffer known to the scheduler
    RegisterBuffer {
        id: u64,
        width: u32,
        height: u32,
        /// Pixel format code: 0 = RGBA8888, 1 = RGBX8888, 2 = BGRA8888, 3 = RGB565,
        /// 4 = NV12, 5 = NV21, 6 = YV12, 7 = P010
        format: u32,
        /// Memory layout code: 0 = linear, 1 = tiled, 2 = compressed
        layout: u32,
        protected: bool,
    },

    /// Drop the scheduler's reference to a buffer
    UnregisterBuffer { id: u64 },

    /// One frame's layer list for one display, bottom layer first
    ///
    /// Answered with `SchedulerEvent::Prepared`.
    Frame {
        display: u32,
        geometry_changed: bool,
        layers: Vec<LayerDesc>,
    },

    /// Show the prepared frame
    Present {
        display: u32,
        /// Buffer holding the layers marked `Client`, already rendered
        client_target: Option<u64>,
    },

    /// Blank or unblank a display
    Blank { display: u32, blank: bool },

    /// Enable or disable vsync notifications for a display
    SetVsync { display: u32, enabled: bool },
}

/// Rectangle in integer pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RectDesc {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Blend mode as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendDesc {
    #[default]
    None,
    Premultiplied,
    Coverage,
}

/// One layer of a frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDesc {
    pub buffer: Option<u64>,
    pub source: RectDesc,
    pub dest: RectDesc,
    /// Transform bits: 1 = flip H, 2 = flip V, 4 = rotate 90
    #[serde(default)]
    pub transform: u32,
    #[serde(default)]
    pub blend: BlendDesc,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Layer flag bits: 1 = opaque, 2 = protected, 4 = undefined content,
    /// 8 = must composite
    #[serde(default)]
    pub flags: u32,
    /// Producer wrote new content into the buffer for this frame
    #[serde(default)]
    pub content_updated: bool,
}

fn default_alpha() -> f32 {
    1.0
}

// ============================================================================
// Scheduler → Producer Events
// ============================================================================

/// How a layer ended up being shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionDesc {
    /// Scanned out by a dedicated hardware plane
    Device,
    /// Merged by one of the scheduler's compositor backends
    Backend,
    /// Producer must render it into the client target
    Client,
}

/// Events sent from the scheduler to connected producers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    /// Result of the assignment pass for one frame
    Prepared {
        display: u32,
        frame: u64,
        layers: Vec<CompositionDesc>,
    },

    /// Frame was handed to the display controller
    Presented { display: u32, frame: u64, ok: bool },

    /// Display refresh
    Vsync { display: u32, timestamp_ns: u64 },

    /// Display connected or disconnected
    Hotplug { display: u32, connected: bool },
}

// ============================================================================
// Message Framing
// ============================================================================

/// Upper bound on a single framed message
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// A framed message with length prefix for reliable socket reads
#[derive(Debug)]
pub struct FramedMessage {
    pub data: Vec<u8>,
}

impl FramedMessage {
    /// Create a new framed message from serializable data
    pub fn new<T: Serialize>(msg: &T) -> anyhow::Result<Self> {
        let data = serde_json::to_vec(msg)?;
        Ok(Self { data })
    }

    /// Encode message with length prefix (4 bytes, big-endian)
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u32;
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a producer message from bytes
    pub fn decode_producer_message(data: &[u8]) -> anyhow::Result<ProducerMessage> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode a scheduler event from bytes
    pub fn decode_scheduler_event(data: &[u8]) -> anyhow::Result<SchedulerEvent> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_message_defaults() {
        let json = r#"{
            "type": "Frame",
            "display": 0,
            "geometry_changed": true,
            "layers": [{
                "buffer": 7,
                "source": {"x": 0, "y": 0, "width": 64, "height": 64},
                "dest": {"x": 10, "y": 10, "width": 64, "height": 64}
            }]
        }"#;

        match FramedMessage::decode_producer_message(json.as_bytes()).unwrap() {
            ProducerMessage::Frame { layers, .. } => {
                assert_eq!(layers.len(), 1);
                assert_eq!(layers[0].alpha, 1.0);
                assert_eq!(layers[0].blend, BlendDesc::None);
                assert_eq!(layers[0].transform, 0);
                assert!(!layers[0].content_updated);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_present_message() {
        let json = r#"{"type": "Present", "display": 1, "client_target": 42}"#;
        match FramedMessage::decode_producer_message(json.as_bytes()).unwrap() {
            ProducerMessage::Present { display, client_target } => {
                assert_eq!(display, 1);
                assert_eq!(client_target, Some(42));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_encode_length_prefix() {
        let event = SchedulerEvent::Vsync {
            display: 1,
            timestamp_ns: 16_666_667,
        };

        let msg = FramedMessage::new(&event).unwrap();
        let encoded = msg.encode();
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);

        match FramedMessage::decode_scheduler_event(&encoded[4..]).unwrap() {
            SchedulerEvent::Vsync { display, timestamp_ns } => {
                assert_eq!(display, 1);
                assert_eq!(timestamp_ns, 16_666_667);
            }
            other => panic!("Wrong event type: {:?}", other),
        }
    }
}
