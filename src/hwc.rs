//! Scheduler service object
//!
//! `Hwc` is built once from the configuration and owns every display, the
//! shared blit engine and the per-display event threads. Teardown runs in a
//! fixed order: event threads first (they hold display state), then the
//! displays (they return scratch memory), then the blit engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::display::{ClientTarget, Display, PrepareSummary};
use crate::event_thread::{EventThread, LineSource};
use crate::hotplug::{self, HotplugEvent};
use crate::scratch::{BlitCaps, BlitEngine, ThreadedBlitEngine};
use crate::shared::{DisplayId, Layer};
use crate::submit::{DisplayController, VirtualController};
use crate::sync::Fence;
use crate::vsync;

/// Nominal refresh period for displays without a vsync source
const SOFTWARE_REFRESH: Duration = Duration::from_nanos(16_666_667);

/// Notifications delivered from the event threads
pub trait HwcCallbacks: Send + Sync {
    fn vsync(&self, display: DisplayId, timestamp_ns: u64);

    fn hotplug(&self, display: DisplayId, connected: bool);
}

/// One display's frame for `Hwc::prepare_all`
#[derive(Debug)]
pub struct DisplayFrame {
    pub display: DisplayId,
    pub layers: Vec<Layer>,
    pub geometry_changed: bool,
}

pub struct Hwc {
    threads: Vec<EventThread>,
    displays: Vec<Display>,
    engine: Arc<ThreadedBlitEngine>,
}

impl Hwc {
    /// Build displays backed by in-process controllers
    pub fn new(config: &Config, callbacks: Arc<dyn HwcCallbacks>) -> Result<Self> {
        let controllers = config
            .displays
            .iter()
            .map(|d| Box::new(VirtualController::new(d.name.clone())) as Box<dyn DisplayController>)
            .collect();
        Self::with_controllers(config, controllers, callbacks)
    }

    /// Build one display per configured entry, paired with `controllers`
    pub fn with_controllers(
        config: &Config,
        controllers: Vec<Box<dyn DisplayController>>,
        callbacks: Arc<dyn HwcCallbacks>,
    ) -> Result<Self> {
        anyhow::ensure!(
            controllers.len() == config.displays.len(),
            "{} controllers for {} displays",
            controllers.len(),
            config.displays.len()
        );

        let engine = Arc::new(ThreadedBlitEngine::spawn(
            "scratch",
            BlitCaps::default(),
            config.sync.policy().fence_timeout,
        ));
        let shared_engine: Arc<dyn BlitEngine> = engine.clone();

        let mut hwc = Self {
            threads: Vec::new(),
            displays: Vec::with_capacity(config.displays.len()),
            engine,
        };

        for (index, (display_config, controller)) in config.displays.iter().zip(controllers).enumerate() {
            let id = DisplayId(index as u32);
            let display = Display::new(id, display_config, config, Arc::clone(&shared_engine), controller);
            let shared = display.shared();

            let on_vsync = Arc::clone(&callbacks);
            let vsync_callback: vsync::VsyncCallback = Arc::new(move |id, ts| on_vsync.vsync(id, ts));
            let vsync_thread = match &display_config.vsync_path {
                Some(path) => vsync::spawn(Arc::clone(&shared), LineSource::open(path)?, vsync_callback),
                None => vsync::spawn_software(Arc::clone(&shared), SOFTWARE_REFRESH, vsync_callback),
            }
            .with_context(|| format!("Failed to start vsync thread for {id}"))?;
            hwc.threads.push(vsync_thread);

            if let Some(path) = &display_config.hotplug_path {
                let on_hotplug = Arc::clone(&callbacks);
                let hotplug_callback: hotplug::HotplugCallback =
                    Arc::new(move |id, event: HotplugEvent| on_hotplug.hotplug(id, event.is_connected()));
                let thread = hotplug::spawn(shared, LineSource::open(path)?, hotplug_callback)
                    .with_context(|| format!("Failed to start hotplug thread for {id}"))?;
                hwc.threads.push(thread);
            }

            hwc.displays.push(display);
        }

        info!(displays = hwc.displays.len(), threads = hwc.threads.len(), "Scheduler ready");
        Ok(hwc)
    }

    pub fn display_count(&self) -> usize {
        self.displays.len()
    }

    pub fn display(&self, id: DisplayId) -> Option<&Display> {
        self.displays.get(id.0 as usize)
    }

    pub fn display_mut(&mut self, id: DisplayId) -> Option<&mut Display> {
        self.displays.get_mut(id.0 as usize)
    }

    pub fn engine(&self) -> &ThreadedBlitEngine {
        &self.engine
    }

    /// Prepare one display outside a multi-display cycle
    pub fn prepare(&mut self, id: DisplayId, layers: &mut [Layer], geometry_changed: bool) -> Option<PrepareSummary> {
        let display = self.display_mut(id)?;
        Some(display.prepare(layers, geometry_changed, true))
    }

    /// Prepare every display of one refresh cycle
    ///
    /// Only the last display is told it closes the cycle.
    pub fn prepare_all(&mut self, frames: &mut [DisplayFrame]) -> Vec<PrepareSummary> {
        let last = frames.len().saturating_sub(1);
        let mut summaries = Vec::with_capacity(frames.len());
        for (index, frame) in frames.iter_mut().enumerate() {
            let Some(display) = self.displays.get_mut(frame.display.0 as usize) else {
                warn!(display = %frame.display, "Frame for unknown display");
                summaries.push(PrepareSummary {
                    skipped: true,
                    ..Default::default()
                });
                continue;
            };
            summaries.push(display.prepare(&mut frame.layers, frame.geometry_changed, index == last));
        }
        summaries
    }

    pub fn present(
        &mut self,
        id: DisplayId,
        layers: &mut [Layer],
        client_target: Option<ClientTarget<'_>>,
    ) -> Fence {
        match self.display_mut(id) {
            Some(display) => display.present(layers, client_target),
            None => {
                warn!(display = %id, "Present for unknown display");
                Fence::invalid()
            }
        }
    }

    pub fn set_vsync_enabled(&self, id: DisplayId, enabled: bool) -> bool {
        match self.display(id) {
            Some(display) => {
                debug!(display = %id, enabled, "Vsync toggled");
                display.shared().set_vsync_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn blank(&self, id: DisplayId, blanked: bool) -> bool {
        match self.display(id) {
            Some(display) => {
                display.blank(blanked);
                true
            }
            None => false,
        }
    }

    /// State report for every display
    pub fn dump(&self) -> String {
        let mut out = format!("blit engine: {:?}\n", self.engine);
        for display in &self.displays {
            out.push_str(&display.dump());
        }
        out
    }
}

impl Drop for Hwc {
    fn drop(&mut self) {
        for thread in self.threads.drain(..) {
            debug!(thread = thread.name(), "Stopping event thread");
            thread.shutdown();
        }
        self.displays.clear();
        debug!("Scheduler torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DisplayConfig;
    use crate::shared::{BlendMode, LayerFlags, PixelFormat, Rect};
    use crate::sync::{BufferDesc, BufferHandle, BufferId};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        hotplugs: Mutex<Vec<(DisplayId, bool)>>,
    }

    impl HwcCallbacks for Recorder {
        fn vsync(&self, _display: DisplayId, _timestamp_ns: u64) {}

        fn hotplug(&self, display: DisplayId, connected: bool) {
            self.hotplugs.lock().unwrap().push((display, connected));
        }
    }

    fn config() -> Config {
        Config {
            displays: vec![
                DisplayConfig::default_panel(),
                DisplayConfig {
                    name: "external".into(),
                    ..DisplayConfig::default_panel()
                },
            ],
            ..Config::default()
        }
    }

    fn layers(buffer: &BufferHandle) -> Vec<Layer> {
        vec![
            Layer::new(Some(buffer.register()), Rect::sized(1920, 1080), Rect::sized(1920, 1080))
                .with_flags(LayerFlags::OPAQUE),
            Layer::new(Some(buffer.register()), Rect::sized(640, 480), Rect::new(40, 40, 640, 480))
                .with_blend(BlendMode::Premultiplied),
        ]
    }

    #[test]
    fn test_prepare_all_and_present() {
        let mut hwc = Hwc::new(&config(), Arc::new(Recorder::default())).unwrap();
        assert_eq!(hwc.display_count(), 2);
        let buffer = BufferHandle::allocate(BufferId(1), BufferDesc::new(1920, 1080, PixelFormat::Rgba8888));

        let mut frames = vec![
            DisplayFrame {
                display: DisplayId(0),
                layers: layers(&buffer),
                geometry_changed: true,
            },
            DisplayFrame {
                display: DisplayId(1),
                layers: layers(&buffer),
                geometry_changed: true,
            },
            DisplayFrame {
                display: DisplayId(7),
                layers: Vec::new(),
                geometry_changed: false,
            },
        ];
        let summaries = hwc.prepare_all(&mut frames);
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].plane_layers, 2);
        assert!(summaries[2].skipped);

        for frame in frames.iter_mut().take(2) {
            let present = hwc.present(frame.display, &mut frame.layers, None);
            assert!(present.is_valid());
        }
        assert!(hwc.dump().contains("external"));
    }

    #[test]
    fn test_unknown_display_controls() {
        let hwc = Hwc::new(&config(), Arc::new(Recorder::default())).unwrap();
        assert!(hwc.set_vsync_enabled(DisplayId(0), true));
        assert!(hwc.display(DisplayId(0)).unwrap().shared().vsync_enabled());
        assert!(!hwc.set_vsync_enabled(DisplayId(9), true));
        assert!(!hwc.blank(DisplayId(9), true));
    }

    #[test]
    fn test_controller_count_must_match() {
        let controllers: Vec<Box<dyn DisplayController>> = vec![Box::new(VirtualController::new("only"))];
        assert!(Hwc::with_controllers(&config(), controllers, Arc::new(Recorder::default())).is_err());
    }
}
