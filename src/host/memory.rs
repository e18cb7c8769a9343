//! In-process host implementation.
//!
//! `MemoryHost` keeps a small object graph in memory, notifies observers
//! synchronously on the writing thread, and exposes capture sources whose
//! frames are pushed by the caller (a test, or the demo runner's frame
//! generator). It also counts open capture bindings so teardown can be
//! verified.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;

use super::{
    AttributeObserver, CaptureEndpoint, CaptureSettings, Frame, Host, SubscriptionId,
};
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

/// Maximum number of log lines retained.
const LOG_CAPACITY: usize = 256;

/// Type name given to capture sources.
pub const CAPTURE_TYPE: &str = "capture";

#[derive(Debug, Default)]
struct MemoryObject {
    type_name: String,
    /// Attributes in declaration order.
    attributes: Vec<(String, Value)>,
    descriptions: HashMap<String, String>,
    links: Vec<String>,
}

impl MemoryObject {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn attribute_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.attributes
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

struct Subscription {
    object: String,
    attribute: String,
    observer: AttributeObserver,
}

#[derive(Default)]
struct HostState {
    objects: BTreeMap<String, MemoryObject>,
    globals: BTreeMap<String, Value>,
    categories: BTreeMap<String, Vec<String>>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_subscription: SubscriptionId,
    captures: HashMap<String, Arc<MemoryCapture>>,
    logs: VecDeque<(String, String, String)>,
    timings: BTreeMap<String, i64>,
}

/// In-memory [`Host`] implementation.
pub struct MemoryHost {
    state: Mutex<HostState>,
    open_bindings: Arc<AtomicUsize>,
    started: Instant,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (objects, subscriptions) = self
            .state
            .lock()
            .map(|s| (s.objects.len(), s.subscriptions.len()))
            .unwrap_or((0, 0));
        f.debug_struct("MemoryHost")
            .field("objects", &objects)
            .field("subscriptions", &subscriptions)
            .field("open_bindings", &self.open_capture_count())
            .finish_non_exhaustive()
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_subscription: 1,
                ..HostState::default()
            }),
            open_bindings: Arc::new(AtomicUsize::new(0)),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().expect("MemoryHost state mutex poisoned")
    }

    /// Add (or replace) an object with the given attributes.
    pub fn add_object(&self, name: &str, type_name: &str, attributes: Vec<(&str, Value)>) {
        let object = MemoryObject {
            type_name: type_name.to_string(),
            attributes: attributes
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
            ..MemoryObject::default()
        };
        self.lock().objects.insert(name.to_string(), object);
    }

    /// Add a capture source, also visible as an object of type `capture`.
    pub fn add_capture_source(&self, name: &str, max_width: u32, max_height: u32) -> Arc<MemoryCapture> {
        let capture = Arc::new(MemoryCapture::new(
            name,
            max_width,
            max_height,
            Arc::clone(&self.open_bindings),
        ));
        self.add_object(name, CAPTURE_TYPE, Vec::new());
        self.lock()
            .captures
            .insert(name.to_string(), Arc::clone(&capture));
        capture
    }

    /// Link `from` to `to`. Both must exist.
    pub fn add_link(&self, from: &str, to: &str) -> bool {
        let mut state = self.lock();
        if !state.objects.contains_key(to) {
            return false;
        }
        match state.objects.get_mut(from) {
            Some(object) => {
                object.links.push(to.to_string());
                true
            }
            None => false,
        }
    }

    /// Declare that a type belongs to a category.
    pub fn add_type_to_category(&self, category: &str, type_name: &str) {
        self.lock()
            .categories
            .entry(category.to_string())
            .or_default()
            .push(type_name.to_string());
    }

    /// Record a timing measurement, in microseconds.
    pub fn record_timing(&self, name: &str, micros: i64) {
        self.lock().timings.insert(name.to_string(), micros);
    }

    /// Append a host log line.
    pub fn log(&self, level: &str, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        let mut state = self.lock();
        if state.logs.len() == LOG_CAPACITY {
            state.logs.pop_front();
        }
        state
            .logs
            .push_back((stamp, level.to_string(), message.to_string()));
    }

    /// Read a global attribute set via [`Host::set_global`].
    #[must_use]
    pub fn global(&self, attribute: &str) -> Option<Value> {
        self.lock().globals.get(attribute).cloned()
    }

    /// Number of live attribute subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Number of capture endpoints currently opened.
    #[must_use]
    pub fn open_capture_count(&self) -> usize {
        self.open_bindings.load(Ordering::SeqCst)
    }
}

impl Host for MemoryHost {
    fn list_objects(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    fn object_types(&self) -> Vec<(String, String)> {
        self.lock()
            .objects
            .iter()
            .map(|(name, obj)| (name.clone(), obj.type_name.clone()))
            .collect()
    }

    fn object_type(&self, object: &str) -> Option<String> {
        self.lock().objects.get(object).map(|o| o.type_name.clone())
    }

    fn get_attribute(&self, object: &str, attribute: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(object)
            .and_then(|o| o.attribute(attribute))
            .cloned()
    }

    fn get_attributes(&self, object: &str) -> Option<Vec<(String, Value)>> {
        self.lock().objects.get(object).map(|o| o.attributes.clone())
    }

    fn set_attribute(&self, object: &str, attribute: &str, value: Value) -> bool {
        let observers: Vec<AttributeObserver> = {
            let mut state = self.lock();
            let Some(slot) = state
                .objects
                .get_mut(object)
                .and_then(|o| o.attribute_mut(attribute))
            else {
                return false;
            };
            *slot = value.clone();
            state
                .subscriptions
                .values()
                .filter(|s| s.object == object && s.attribute == attribute)
                .map(|s| Arc::clone(&s.observer))
                .collect()
        };
        // Lock released before notifying; observers may call back into the host.
        for observer in observers {
            observer(object, attribute, &value);
        }
        true
    }

    fn set_global(&self, attribute: &str, value: Value) -> bool {
        self.lock().globals.insert(attribute.to_string(), value);
        true
    }

    fn describe_object(&self, object: &str) -> Option<String> {
        self.lock().objects.get(object).map(|o| {
            format!(
                "{} object with {} attribute(s)",
                o.type_name,
                o.attributes.len()
            )
        })
    }

    fn describe_attribute(&self, object: &str, attribute: &str) -> Option<String> {
        let state = self.lock();
        let obj = state.objects.get(object)?;
        if let Some(desc) = obj.descriptions.get(attribute) {
            return Some(desc.clone());
        }
        obj.attribute(attribute)
            .map(|v| format!("{} attribute", v.type_name()))
    }

    fn list_links(&self, object: &str) -> Option<Vec<String>> {
        self.lock().objects.get(object).map(|o| o.links.clone())
    }

    fn list_reverse_links(&self, object: &str) -> Option<Vec<String>> {
        let state = self.lock();
        if !state.objects.contains_key(object) {
            return None;
        }
        Some(
            state
                .objects
                .iter()
                .filter(|(_, o)| o.links.iter().any(|l| l == object))
                .map(|(name, _)| name.clone())
                .collect(),
        )
    }

    fn add_custom_attribute(&self, object: &str, attribute: &str, default: Value) -> bool {
        let mut state = self.lock();
        let Some(obj) = state.objects.get_mut(object) else {
            return false;
        };
        if obj.attribute(attribute).is_some() {
            return false;
        }
        obj.descriptions
            .insert(attribute.to_string(), "Custom attribute".to_string());
        obj.attributes.push((attribute.to_string(), default));
        true
    }

    fn types_in_category(&self, category: &str) -> Vec<String> {
        self.lock()
            .categories
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    fn subscribe(
        &self,
        object: &str,
        attribute: &str,
        observer: AttributeObserver,
    ) -> Option<SubscriptionId> {
        let mut state = self.lock();
        state.objects.get(object)?.attribute(attribute)?;
        let id = state.next_subscription;
        state.next_subscription += 1;
        state.subscriptions.insert(
            id,
            Subscription {
                object: object.to_string(),
                attribute: attribute.to_string(),
                observer,
            },
        );
        Some(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscriptions.remove(&id).is_some()
    }

    fn capture_endpoint(&self, name: &str) -> BridgeResult<Arc<dyn CaptureEndpoint>> {
        let state = self.lock();
        if let Some(capture) = state.captures.get(name) {
            let binding: Arc<dyn CaptureEndpoint> = Arc::new(capture.bind());
            return Ok(binding);
        }
        match state.objects.get(name) {
            Some(obj) => Err(BridgeError::invalid_state(format!(
                "object '{}' of type '{}' is not a capture source",
                name, obj.type_name
            ))),
            None => Err(BridgeError::not_found(format!("capture source '{name}'"))),
        }
    }

    fn logs(&self) -> Value {
        self.lock()
            .logs
            .iter()
            .map(|(stamp, level, msg)| {
                Value::Seq(vec![
                    Value::from(stamp.as_str()),
                    Value::from(level.as_str()),
                    Value::from(msg.as_str()),
                ])
            })
            .collect()
    }

    fn timings(&self) -> Value {
        self.lock()
            .timings
            .iter()
            .map(|(name, micros)| Value::pair(name.as_str(), *micros))
            .collect()
    }

    fn master_clock(&self) -> Value {
        let elapsed_ms = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        Value::Seq(vec![
            Value::pair("time_ms", elapsed_ms),
            Value::pair("paused", false),
        ])
    }
}

#[derive(Debug)]
struct SourceState {
    latest: Option<Frame>,
    sequence: u64,
    /// Framerate requested by each open binding, by binding id.
    open: BTreeMap<u64, u32>,
}

/// Capture source of a [`MemoryHost`]; frames are pushed by the producer.
///
/// Sinks never see the source directly. Each [`Host::capture_endpoint`]
/// call hands out a fresh [`MemoryBinding`] with its own open state, size
/// and framerate. Frames are produced once, at source resolution, and
/// shared by every binding.
#[derive(Debug)]
pub struct MemoryCapture {
    name: String,
    max_width: u32,
    max_height: u32,
    state: Mutex<SourceState>,
    next_binding: AtomicU64,
    open_bindings: Arc<AtomicUsize>,
}

impl MemoryCapture {
    fn new(name: &str, max_width: u32, max_height: u32, open_bindings: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            max_width,
            max_height,
            state: Mutex::new(SourceState {
                latest: None,
                sequence: 0,
                open: BTreeMap::new(),
            }),
            next_binding: AtomicU64::new(1),
            open_bindings,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().expect("MemoryCapture state mutex poisoned")
    }

    /// Create an independent binding to this source.
    #[must_use]
    pub fn bind(self: &Arc<Self>) -> MemoryBinding {
        MemoryBinding {
            id: self.next_binding.fetch_add(1, Ordering::Relaxed),
            source: Arc::clone(self),
            state: Mutex::new(BindingState {
                opened: false,
                width: self.max_width,
                height: self.max_height,
                framerate: 30,
                keep_ratio: false,
            }),
        }
    }

    /// Produce a new frame at source resolution. Returns its sequence number.
    pub fn push_frame(&self, data: impl Into<Bytes>) -> u64 {
        let mut state = self.lock();
        state.sequence += 1;
        let frame = Frame {
            data: data.into(),
            width: self.max_width,
            height: self.max_height,
            sequence: state.sequence,
        };
        state.latest = Some(frame);
        state.sequence
    }

    /// Most recent frame pushed by the producer.
    #[must_use]
    pub fn latest_frame(&self) -> Option<Frame> {
        self.lock().latest.clone()
    }

    /// Whether at least one binding has this source opened.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.lock().open.is_empty()
    }

    /// Number of bindings that currently have this source opened.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    /// Source resolution `(width, height)`.
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.max_width, self.max_height)
    }

    /// Highest framerate requested by an open binding, 30 when none is open.
    #[must_use]
    pub fn framerate(&self) -> u32 {
        self.lock().open.values().copied().max().unwrap_or(30)
    }

    fn mark_open(&self, binding: u64, framerate: u32) {
        if self.lock().open.insert(binding, framerate).is_none() {
            self.open_bindings.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mark_closed(&self, binding: u64) {
        if self.lock().open.remove(&binding).is_some() {
            self.open_bindings.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
struct BindingState {
    opened: bool,
    width: u32,
    height: u32,
    framerate: u32,
    keep_ratio: bool,
}

/// One sink's binding to a [`MemoryCapture`]. Closed on drop.
#[derive(Debug)]
pub struct MemoryBinding {
    id: u64,
    source: Arc<MemoryCapture>,
    state: Mutex<BindingState>,
}

impl MemoryBinding {
    fn lock(&self) -> std::sync::MutexGuard<'_, BindingState> {
        self.state.lock().expect("MemoryBinding state mutex poisoned")
    }

    /// Whether this binding is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().opened
    }

    /// Size requested by this binding.
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        let state = self.lock();
        (state.width, state.height)
    }
}

impl CaptureEndpoint for MemoryBinding {
    fn name(&self) -> &str {
        &self.source.name
    }

    fn open(&self, settings: CaptureSettings) -> bool {
        let mut state = self.lock();
        state.keep_ratio = settings.keep_ratio;
        state.framerate = settings.framerate.max(1);
        state.width = settings.width.clamp(1, self.source.max_width);
        state.height = settings.height.clamp(1, self.source.max_height);
        state.opened = true;
        self.source.mark_open(self.id, state.framerate);
        true
    }

    fn close(&self) {
        let mut state = self.lock();
        if state.opened {
            state.opened = false;
            self.source.mark_closed(self.id);
        }
    }

    fn latest_frame(&self) -> Option<Frame> {
        self.source.latest_frame()
    }

    fn set_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (max_width, max_height) = self.source.size();
        let mut state = self.lock();
        let (mut w, mut h) = (width.clamp(1, max_width), height.clamp(1, max_height));
        if state.keep_ratio {
            // Scale down uniformly so both sides fit the source.
            let ratio = (f64::from(max_width) / f64::from(width.max(1)))
                .min(f64::from(max_height) / f64::from(height.max(1)))
                .min(1.0);
            w = ((f64::from(width) * ratio) as u32).max(1);
            h = ((f64::from(height) * ratio) as u32).max(1);
        }
        state.width = w;
        state.height = h;
        (w, h)
    }

    fn set_framerate(&self, framerate: u32) {
        let mut state = self.lock();
        state.framerate = framerate.max(1);
        if state.opened {
            self.source.mark_open(self.id, state.framerate);
        }
    }

    fn caps(&self) -> String {
        let state = self.lock();
        format!(
            "video/x-raw, format=(string)RGBA, width=(int){}, height=(int){}, framerate=(fraction){}/1",
            state.width, state.height, state.framerate
        )
    }
}

impl Drop for MemoryBinding {
    fn drop(&mut self) {
        self.close();
    }
}
