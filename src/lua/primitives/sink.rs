//! Frame sink primitive for Lua scripts.
//!
//! A sink binds to a named capture endpoint on the host and exposes its most
//! recent frame to the script as a [`LuaBuffer`].
//!
//! # Usage in Lua
//!
//! ```lua
//! local sink = stage.Sink{ source = "main_view", width = 256, height = 256 }
//! sink:open()
//!
//! function update()
//!     local frame = sink:grab()
//!     if frame then
//!         log.debug("grabbed " .. #frame .. " bytes")
//!     end
//! end
//! ```
//!
//! Failures never raise: `link`/`open` return false and `grab` returns nil.
//! Every sink is tracked by its instance so teardown can release capture
//! bindings even if the script still references the sink.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use mlua::prelude::*;

use crate::error::{BridgeError, BridgeResult};
use crate::host::{CaptureEndpoint, CaptureSettings, Frame, SharedHost};
use crate::lua::codec::LuaBuffer;

/// Default capture width.
pub const DEFAULT_WIDTH: u32 = 512;
/// Default capture height.
pub const DEFAULT_HEIGHT: u32 = 512;
/// Default capture framerate.
pub const DEFAULT_FRAMERATE: u32 = 30;

static NEXT_SINK_INDEX: AtomicU64 = AtomicU64::new(0);

/// State of one frame sink.
pub struct FrameSinkState {
    name: String,
    source: Option<String>,
    endpoint: Option<Arc<dyn CaptureEndpoint>>,
    settings: CaptureSettings,
    opened: bool,
    held: Option<Frame>,
}

impl fmt::Debug for FrameSinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSinkState")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("settings", &self.settings)
            .field("opened", &self.opened)
            .finish_non_exhaustive()
    }
}

impl Default for FrameSinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSinkState {
    /// Unlinked sink with default settings and a fresh `sink_<n>` name.
    pub fn new() -> Self {
        let index = NEXT_SINK_INDEX.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("sink_{index}"),
            source: None,
            endpoint: None,
            settings: CaptureSettings {
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                framerate: DEFAULT_FRAMERATE,
                keep_ratio: false,
            },
            opened: false,
            held: None,
        }
    }

    /// Sink name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the linked source.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Whether a capture endpoint is bound.
    pub fn is_linked(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Whether capture is running.
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Bind to the host capture endpoint `source`.
    pub fn link(&mut self, host: &SharedHost, source: &str) -> BridgeResult<()> {
        if let Some(current) = &self.source {
            return Err(BridgeError::invalid_state(format!(
                "{} is already linked to '{}'",
                self.name, current
            )));
        }
        let endpoint = host.capture_endpoint(source)?;
        self.settings.width = self.settings.width.max(1);
        self.settings.height = self.settings.height.max(1);
        let (width, height) = endpoint.set_size(self.settings.width, self.settings.height);
        self.settings.width = width;
        self.settings.height = height;
        endpoint.set_framerate(self.settings.framerate);
        self.endpoint = Some(endpoint);
        self.source = Some(source.to_string());
        log::debug!("{} linked to '{}'", self.name, source);
        Ok(())
    }

    /// Close and drop the binding. No-op when unlinked.
    pub fn unlink(&mut self) {
        self.close();
        if let Some(source) = self.source.take() {
            self.endpoint = None;
            log::debug!("{} unlinked from '{}'", self.name, source);
        }
    }

    /// Start capturing at the configured size and rate.
    pub fn open(&mut self) -> BridgeResult<()> {
        let Some(endpoint) = &self.endpoint else {
            return Err(BridgeError::invalid_state(format!(
                "{} cannot open: not linked",
                self.name
            )));
        };
        if !endpoint.open(self.settings) {
            return Err(BridgeError::invalid_state(format!(
                "capture endpoint '{}' refused to open",
                endpoint.name()
            )));
        }
        self.opened = true;
        Ok(())
    }

    /// Stop capturing and release the held frame. No-op when closed.
    pub fn close(&mut self) {
        self.held = None;
        if !self.opened {
            return;
        }
        self.opened = false;
        if let Some(endpoint) = &self.endpoint {
            endpoint.close();
        }
    }

    /// Request new dimensions. Returns the size actually applied.
    pub fn set_size(&mut self, width: u32, height: u32) -> (u32, u32) {
        let (width, height) = (width.max(1), height.max(1));
        let applied = match &self.endpoint {
            Some(endpoint) => endpoint.set_size(width, height),
            None => (width, height),
        };
        self.settings.width = applied.0;
        self.settings.height = applied.1;
        applied
    }

    /// Current dimensions.
    pub fn size(&self) -> (u32, u32) {
        (self.settings.width, self.settings.height)
    }

    /// Toggle aspect-ratio preservation. Reapplied immediately when open.
    pub fn set_keep_ratio(&mut self, keep: bool) {
        self.settings.keep_ratio = keep;
        if self.opened {
            if let Some(endpoint) = &self.endpoint {
                endpoint.open(self.settings);
            }
        }
    }

    /// Request a capture framerate.
    pub fn set_framerate(&mut self, framerate: u32) {
        self.settings.framerate = framerate.max(1);
        if let Some(endpoint) = &self.endpoint {
            endpoint.set_framerate(self.settings.framerate);
        }
    }

    /// Most recent frame. Repeats the held frame when the source has not
    /// produced a new one; `Ok(None)` if nothing was produced yet.
    pub fn grab(&mut self) -> BridgeResult<Option<Frame>> {
        if !self.opened {
            return Err(BridgeError::invalid_state(format!(
                "{} cannot grab: not open",
                self.name
            )));
        }
        let latest = self.endpoint.as_ref().and_then(|e| e.latest_frame());
        if let Some(frame) = latest {
            let repeated = matches!(&self.held, Some(held) if held.sequence == frame.sequence);
            if !repeated {
                self.held = Some(frame);
            }
        }
        Ok(self.held.clone())
    }

    /// Capability description.
    pub fn caps(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.caps(),
            None => format!(
                "unlinked, width={}, height={}, framerate={}",
                self.settings.width, self.settings.height, self.settings.framerate
            ),
        }
    }

    /// Teardown: close capture, drop the held frame, release the binding.
    pub fn release(&mut self) {
        self.close();
        self.unlink();
    }
}

/// Shared handle to a sink's state.
pub type SharedSink = Arc<Mutex<FrameSinkState>>;

/// Per-instance record of created sinks.
#[derive(Debug, Clone, Default)]
pub struct SinkTracker {
    sinks: Arc<Mutex<Vec<Weak<Mutex<FrameSinkState>>>>>,
}

impl SinkTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a sink.
    pub fn track(&self, sink: &SharedSink) {
        let mut sinks = self.sinks.lock().expect("sink tracker mutex poisoned");
        sinks.retain(|weak| weak.strong_count() > 0);
        sinks.push(Arc::downgrade(sink));
    }

    /// Number of sinks still alive.
    pub fn live_count(&self) -> usize {
        let sinks = self.sinks.lock().expect("sink tracker mutex poisoned");
        sinks.iter().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Release every live sink. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let sinks: Vec<_> = self
            .sinks
            .lock()
            .expect("sink tracker mutex poisoned")
            .drain(..)
            .collect();
        let mut released = 0;
        for sink in sinks.iter().filter_map(Weak::upgrade) {
            sink.lock().expect("frame sink mutex poisoned").release();
            released += 1;
        }
        released
    }
}

/// Lua userdata wrapping a frame sink.
pub struct LuaFrameSink {
    state: SharedSink,
    host: SharedHost,
}

impl fmt::Debug for LuaFrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaFrameSink")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl LuaFrameSink {
    fn with_state<R>(&self, f: impl FnOnce(&mut FrameSinkState) -> R) -> R {
        f(&mut self.state.lock().expect("frame sink mutex poisoned"))
    }
}

impl Drop for LuaFrameSink {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.release();
        }
    }
}

fn report<T>(name: &str, op: &str, result: BridgeResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("{}:{} failed: {}", name, op, e);
            None
        }
    }
}

impl LuaUserData for LuaFrameSink {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        // sink:link(name) -> bool
        methods.add_method("link", |_, this, source: String| {
            Ok(this.with_state(|s| {
                let result = s.link(&this.host, &source);
                report(&s.name, "link", result).is_some()
            }))
        });

        // sink:unlink()
        methods.add_method("unlink", |_, this, ()| {
            this.with_state(FrameSinkState::unlink);
            Ok(())
        });

        // sink:open() -> bool
        methods.add_method("open", |_, this, ()| {
            Ok(this.with_state(|s| {
                let result = s.open();
                report(&s.name, "open", result).is_some()
            }))
        });

        // sink:close()
        methods.add_method("close", |_, this, ()| {
            this.with_state(FrameSinkState::close);
            Ok(())
        });

        // sink:set_size(w, h)
        methods.add_method("set_size", |_, this, (width, height): (u32, u32)| {
            this.with_state(|s| s.set_size(width, height));
            Ok(())
        });

        // sink:get_size() -> { w, h }
        methods.add_method("get_size", |lua, this, ()| {
            let (width, height) = this.with_state(|s| s.size());
            lua.create_sequence_from([width, height])
        });

        // sink:keep_ratio(bool)
        methods.add_method("keep_ratio", |_, this, keep: bool| {
            this.with_state(|s| s.set_keep_ratio(keep));
            Ok(())
        });

        // sink:set_framerate(n)
        methods.add_method("set_framerate", |_, this, framerate: u32| {
            this.with_state(|s| s.set_framerate(framerate));
            Ok(())
        });

        // sink:grab() -> buffer or nil
        methods.add_method("grab", |_, this, ()| {
            // Polled every tick; closed sinks return nil silently.
            Ok(this.with_state(|s| s.grab().ok().flatten().map(|frame| LuaBuffer(frame.data))))
        });

        // sink:get_caps() -> string
        methods.add_method("get_caps", |_, this, ()| Ok(this.with_state(|s| s.caps())));

        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            Ok(this.with_state(|s| match s.source() {
                Some(source) => format!("Sink({} -> {})", s.name(), source),
                None => format!("Sink({})", s.name()),
            }))
        });
    }

    fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("name", |_, this| Ok(this.with_state(|s| s.name().to_string())));
    }
}

/// Constructor keyword options for `stage.Sink{...}`.
#[derive(Debug, Default)]
struct SinkOptions {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    keep_ratio: Option<bool>,
    framerate: Option<u32>,
}

impl SinkOptions {
    fn from_table(table: Option<LuaTable>) -> LuaResult<Self> {
        let Some(table) = table else {
            return Ok(Self::default());
        };
        Ok(Self {
            source: table.get("source")?,
            width: table.get("width")?,
            height: table.get("height")?,
            keep_ratio: table.get("keep_ratio")?,
            framerate: table.get("framerate")?,
        })
    }
}

/// Add the `Sink` constructor to `stage`.
///
/// # Errors
///
/// Returns an error if the constructor cannot be registered.
pub fn register(lua: &Lua, stage: &LuaTable, host: SharedHost, tracker: SinkTracker) -> Result<()> {
    // stage.Sink{ source=?, width=?, height=?, keep_ratio=?, framerate=? }
    let ctor = lua
        .create_function(move |_, options: Option<LuaTable>| {
            let options = SinkOptions::from_table(options)?;
            let mut state = FrameSinkState::new();
            if let Some(keep) = options.keep_ratio {
                state.settings.keep_ratio = keep;
            }
            if let Some(framerate) = options.framerate {
                state.settings.framerate = framerate.max(1);
            }
            state.set_size(
                options.width.unwrap_or(DEFAULT_WIDTH),
                options.height.unwrap_or(DEFAULT_HEIGHT),
            );
            if let Some(source) = options.source.as_deref() {
                let result = state.link(&host, source);
                report(&state.name, "link", result);
            }

            let shared: SharedSink = Arc::new(Mutex::new(state));
            tracker.track(&shared);
            Ok(LuaFrameSink {
                state: shared,
                host: Arc::clone(&host),
            })
        })
        .map_err(|e| anyhow::anyhow!("Failed to create stage.Sink: {e}"))?;

    stage
        .set("Sink", ctor)
        .map_err(|e| anyhow::anyhow!("Failed to set stage.Sink: {e}"))?;

    Ok(())
}
