//! IPC service for scene producers
//!
//! Producers connect over a unix socket, register their buffers and send one
//! `Frame` then one `Present` per display refresh. Results and display
//! events are broadcast back to every connected producer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hwcomp_ipc::{
    socket_path, CompositionDesc, FramedMessage, LayerDesc, ProducerMessage, SchedulerEvent,
    MAX_MESSAGE_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::display::ClientTarget;
use crate::hwc::{Hwc, HwcCallbacks};
use crate::shared::{
    BlendMode, DisplayId, Layer, LayerFlags, MemoryLayout, PixelFormat, Rect, Transform,
};
use crate::sync::{BufferDesc, BufferHandle, BufferId, Fence};

/// Forwards event-thread notifications to connected producers
#[derive(Debug, Clone)]
pub struct EventForwarder {
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl EventForwarder {
    pub fn new(event_tx: broadcast::Sender<SchedulerEvent>) -> Self {
        Self { event_tx }
    }
}

impl HwcCallbacks for EventForwarder {
    fn vsync(&self, display: DisplayId, timestamp_ns: u64) {
        // Ignore error if no receivers
        let _ = self.event_tx.send(SchedulerEvent::Vsync {
            display: display.0,
            timestamp_ns,
        });
    }

    fn hotplug(&self, display: DisplayId, connected: bool) {
        let _ = self.event_tx.send(SchedulerEvent::Hotplug {
            display: display.0,
            connected,
        });
    }
}

/// Applies producer messages to the scheduler
pub struct Scheduler {
    hwc: Hwc,
    buffers: HashMap<BufferId, BufferHandle>,
    /// Layers prepared and waiting for `Present`, per display
    pending: HashMap<DisplayId, Vec<Layer>>,
    frame: u64,
    lock_timeout: Duration,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(hwc: Hwc, lock_timeout: Duration, event_tx: broadcast::Sender<SchedulerEvent>) -> Self {
        Self {
            hwc,
            buffers: HashMap::new(),
            pending: HashMap::new(),
            frame: 0,
            lock_timeout,
            event_tx,
        }
    }

    pub fn hwc(&self) -> &Hwc {
        &self.hwc
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn broadcast(&self, event: SchedulerEvent) {
        // Ignore error if no receivers
        let _ = self.event_tx.send(event);
    }

    pub fn handle(&mut self, message: ProducerMessage) {
        match message {
            ProducerMessage::RegisterBuffer {
                id,
                width,
                height,
                format,
                layout,
                protected,
            } => {
                let desc = BufferDesc::new(width, height, PixelFormat::from_code(format))
                    .with_layout(MemoryLayout::from_code(layout))
                    .with_protected(protected);
                let id = BufferId(id);
                let buffer = BufferHandle::allocate(id, desc);
                trace!(header = ?buffer.header(), "Buffer header");
                if let Some(previous) = self.buffers.insert(id, buffer) {
                    warn!(buffer = %id, "Buffer registered twice, replacing");
                    previous.unregister();
                }
                debug!(buffer = %id, width, height, "Buffer registered");
            }
            ProducerMessage::UnregisterBuffer { id } => match self.buffers.remove(&BufferId(id)) {
                Some(buffer) => {
                    debug!(buffer = %buffer.id(), handles = buffer.handle_count(), "Buffer unregistered");
                    buffer.unregister();
                }
                None => warn!(buffer = id, "Unregister for unknown buffer"),
            },
            ProducerMessage::Frame {
                display,
                geometry_changed,
                layers,
            } => self.prepare(DisplayId(display), geometry_changed, &layers),
            ProducerMessage::Present {
                display,
                client_target,
            } => self.present(DisplayId(display), client_target),
            ProducerMessage::Blank { display, blank } => {
                if !self.hwc.blank(DisplayId(display), blank) {
                    let id = display;
                    warn!(display = id, "Blank for unknown display");
                }
            }
            ProducerMessage::SetVsync { display, enabled } => {
                if !self.hwc.set_vsync_enabled(DisplayId(display), enabled) {
                    let id = display;
                    warn!(display = id, "Vsync control for unknown display");
                }
            }
        }
    }

    fn layer(&self, desc: &LayerDesc) -> Layer {
        let buffer = desc.buffer.and_then(|id| {
            let handle = self.buffers.get(&BufferId(id));
            if handle.is_none() {
                warn!(buffer = id, "Layer references unknown buffer");
            }
            handle.map(BufferHandle::register)
        });
        if desc.content_updated {
            if let Some(buffer) = &buffer {
                buffer.mark_written(Fence::invalid(), self.lock_timeout);
            }
        }
        Layer::new(buffer, Rect::from(desc.source), Rect::from(desc.dest))
            .with_transform(Transform::from_bits_truncate(desc.transform))
            .with_blend(BlendMode::from(desc.blend))
            .with_alpha(desc.alpha.clamp(0.0, 1.0))
            .with_flags(LayerFlags::from_bits_truncate(desc.flags))
    }

    fn prepare(&mut self, display: DisplayId, geometry_changed: bool, descs: &[LayerDesc]) {
        let display_id = display;
        let mut layers: Vec<Layer> = descs.iter().map(|d| self.layer(d)).collect();
        let Some(summary) = self.hwc.prepare(display, &mut layers, geometry_changed) else {
            warn!(display = %display_id, "Frame for unknown display");
            return;
        };
        self.frame += 1;
        trace!(display = %display_id, frame = self.frame, ?summary, "Prepared");
        self.broadcast(SchedulerEvent::Prepared {
            display: display.0,
            frame: self.frame,
            layers: layers.iter().map(|l| CompositionDesc::from(l.composition)).collect(),
        });
        if self.pending.insert(display, layers).is_some() {
            debug!(display = %display_id, "Replacing a prepared frame that was never presented");
        }
    }

    fn present(&mut self, display: DisplayId, client_target: Option<u64>) {
        let display_id = display;
        let Some(mut layers) = self.pending.remove(&display) else {
            warn!(display = %display_id, "Present without a prepared frame");
            return;
        };
        let target = client_target.and_then(|id| self.buffers.get(&BufferId(id)));
        if client_target.is_some() && target.is_none() {
            warn!(display = %display_id, "Unknown client target buffer");
        }
        let client_target = target.map(|buffer| ClientTarget {
            buffer,
            acquire: Fence::invalid(),
        });
        let present = self.hwc.present(display, &mut layers, client_target);
        self.broadcast(SchedulerEvent::Presented {
            display: display.0,
            frame: self.frame,
            ok: present.is_valid(),
        });
    }
}

/// IPC server that broadcasts events to connected producers
pub struct IpcServer {
    /// Sender for broadcasting events to all connected clients
    event_tx: broadcast::Sender<SchedulerEvent>,
    /// Receiver for producer messages
    message_rx: mpsc::Receiver<ProducerMessage>,
    /// Sender for producer messages (cloned into client handlers)
    message_tx: mpsc::Sender<ProducerMessage>,
}

impl IpcServer {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (message_tx, message_rx) = mpsc::channel(256);

        Self {
            event_tx,
            message_rx,
            message_tx,
        }
    }

    /// Sender for broadcasting events, also used by the event threads
    pub fn event_sender(&self) -> broadcast::Sender<SchedulerEvent> {
        self.event_tx.clone()
    }

    /// Start accepting producers (spawns a background task)
    pub async fn start(self) -> Result<IpcHandle> {
        let socket_path = socket_path();

        // Remove existing socket if present
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        // Create parent directory if needed
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!("IPC server listening on {:?}", socket_path);

        let event_tx = self.event_tx.clone();
        let message_tx = self.message_tx.clone();

        // Spawn acceptor task
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        info!("Producer connected");
                        let event_rx = event_tx.subscribe();
                        let msg_tx = message_tx.clone();
                        tokio::spawn(handle_client(stream, event_rx, msg_tx));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(IpcHandle {
            event_tx: self.event_tx,
            message_rx: self.message_rx,
        })
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for interacting with the IPC server
pub struct IpcHandle {
    pub event_tx: broadcast::Sender<SchedulerEvent>,
    pub message_rx: mpsc::Receiver<ProducerMessage>,
}

impl IpcHandle {
    /// Wait for the next producer message
    pub async fn recv(&mut self) -> Option<ProducerMessage> {
        self.message_rx.recv().await
    }
}

/// Read one length-prefixed frame
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_LEN {
        warn!("Message too large: {} bytes", len);
        return None;
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await.ok()?;
    Some(msg_buf)
}

/// Handle a connected producer
async fn handle_client(
    stream: UnixStream,
    mut event_rx: broadcast::Receiver<SchedulerEvent>,
    message_tx: mpsc::Sender<ProducerMessage>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Reader task (producer → scheduler)
    let reader_task = tokio::spawn(async move {
        while let Some(data) = read_frame(&mut reader).await {
            match FramedMessage::decode_producer_message(&data) {
                Ok(message) => {
                    trace!("Received message: {:?}", message);
                    if message_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to decode message: {}", e);
                }
            }
        }
        debug!("Reader task ended");
    });

    // Writer task (scheduler → producer)
    let writer_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => match FramedMessage::new(&event) {
                    Ok(msg) => {
                        if writer.write_all(&msg.encode()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to encode event: {}", e);
                    }
                },
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Lagged {} events", n);
                }
            }
        }
        debug!("Writer task ended");
    });

    // Wait for either task to finish
    tokio::select! {
        _ = reader_task => {}
        _ = writer_task => {}
    }

    info!("Producer disconnected");
}

/// Shared handle to the forwarder, as the event threads expect
pub fn callbacks(event_tx: broadcast::Sender<SchedulerEvent>) -> Arc<dyn HwcCallbacks> {
    Arc::new(EventForwarder::new(event_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use hwcomp_ipc::{BlendDesc, RectDesc};

    fn scheduler() -> (Scheduler, broadcast::Receiver<SchedulerEvent>) {
        let (event_tx, event_rx) = broadcast::channel(64);
        let hwc = Hwc::new(&Config::with_default_display(), callbacks(event_tx.clone())).unwrap();
        (Scheduler::new(hwc, Duration::from_secs(1), event_tx), event_rx)
    }

    fn rect(width: u32, height: u32) -> RectDesc {
        RectDesc {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    fn layer(buffer: u64, width: u32, height: u32) -> LayerDesc {
        LayerDesc {
            buffer: Some(buffer),
            source: rect(width, height),
            dest: rect(width, height),
            transform: 0,
            blend: BlendDesc::Premultiplied,
            alpha: 1.0,
            flags: 0,
            content_updated: true,
        }
    }

    fn register(id: u64, width: u32, height: u32) -> ProducerMessage {
        ProducerMessage::RegisterBuffer {
            id,
            width,
            height,
            format: 0,
            layout: 0,
            protected: false,
        }
    }

    fn next_event(rx: &mut broadcast::Receiver<SchedulerEvent>) -> SchedulerEvent {
        loop {
            match rx.try_recv() {
                Ok(SchedulerEvent::Vsync { .. }) => continue,
                Ok(event) => return event,
                Err(e) => panic!("No event: {:?}", e),
            }
        }
    }

    #[test]
    fn test_frame_then_present() {
        let (mut scheduler, mut rx) = scheduler();
        scheduler.handle(register(1, 1920, 1080));
        scheduler.handle(register(2, 300, 200));
        assert_eq!(scheduler.buffer_count(), 2);

        scheduler.handle(ProducerMessage::Frame {
            display: 0,
            geometry_changed: true,
            layers: vec![layer(1, 1920, 1080), layer(2, 300, 200)],
        });
        match next_event(&mut rx) {
            SchedulerEvent::Prepared { display, frame, layers } => {
                assert_eq!(display, 0);
                assert_eq!(frame, 1);
                assert_eq!(layers, vec![CompositionDesc::Device, CompositionDesc::Device]);
            }
            other => panic!("Wrong event: {:?}", other),
        }

        scheduler.handle(ProducerMessage::Present {
            display: 0,
            client_target: None,
        });
        match next_event(&mut rx) {
            SchedulerEvent::Presented { display, ok, .. } => {
                assert_eq!(display, 0);
                assert!(ok);
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_buffer_and_display() {
        let (mut scheduler, mut rx) = scheduler();
        scheduler.handle(ProducerMessage::Frame {
            display: 5,
            geometry_changed: false,
            layers: vec![layer(9, 64, 64)],
        });
        scheduler.handle(ProducerMessage::Present {
            display: 5,
            client_target: None,
        });
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty) | Ok(SchedulerEvent::Vsync { .. })
        ));

        // Missing buffer: the layer is composed instead of dropped
        scheduler.handle(ProducerMessage::Frame {
            display: 0,
            geometry_changed: true,
            layers: vec![layer(9, 64, 64)],
        });
        match next_event(&mut rx) {
            SchedulerEvent::Prepared { layers, .. } => assert_ne!(layers[0], CompositionDesc::Device),
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_unregister_drops_buffer() {
        let (mut scheduler, _rx) = scheduler();
        scheduler.handle(register(4, 64, 64));
        scheduler.handle(ProducerMessage::UnregisterBuffer { id: 4 });
        scheduler.handle(ProducerMessage::UnregisterBuffer { id: 4 });
        assert_eq!(scheduler.buffer_count(), 0);
    }

    #[test]
    fn test_vsync_and_blank_controls() {
        let (mut scheduler, _rx) = scheduler();
        scheduler.handle(ProducerMessage::SetVsync {
            display: 0,
            enabled: true,
        });
        scheduler.handle(ProducerMessage::Blank {
            display: 0,
            blank: true,
        });
        let shared = scheduler.hwc().display(DisplayId(0)).unwrap().shared();
        assert!(shared.vsync_enabled());
        assert!(shared.state().blanked);
    }
}
