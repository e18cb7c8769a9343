//! Host-side collaborator interfaces.
//!
//! The bridge never talks to the rendering pipeline or the object graph
//! directly. Everything it needs is expressed by two narrow traits:
//!
//! - [`Host`] - object/attribute graph, change notification, diagnostics
//! - [`CaptureEndpoint`] - a named source of rendered frames
//!
//! [`MemoryHost`] is a self-contained implementation used by the demo
//! runner and the test suite.

pub mod memory;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::BridgeResult;
use crate::value::Value;

pub use memory::{MemoryBinding, MemoryCapture, MemoryHost};

/// Callback installed by [`Host::subscribe`]: `(object, attribute, new_value)`.
///
/// The host may invoke it from any thread, including a script thread that is
/// currently inside `stage.set_object_attribute`.
pub type AttributeObserver = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Host-issued handle for an attribute subscription.
pub type SubscriptionId = u64;

/// One rendered frame as produced by a capture endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Pixel data. Shared, so handing a frame to a script does not copy it.
    pub data: Bytes,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Producer sequence number, increases by one per produced frame.
    pub sequence: u64,
}

/// Requested capture parameters, sent when a sink opens an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
    /// Requested frames per second.
    pub framerate: u32,
    /// Preserve the source aspect ratio when scaling.
    pub keep_ratio: bool,
}

/// One sink's binding to a named source of rendered frames.
///
/// Open state, size and framerate belong to the binding. Closing or resizing
/// one binding does not affect other bindings on the same source.
pub trait CaptureEndpoint: Send + Sync {
    /// Endpoint name as known by the host.
    fn name(&self) -> &str;

    /// Start capturing. Returns `false` if the endpoint refuses.
    fn open(&self, settings: CaptureSettings) -> bool;

    /// Stop capturing. Closing a closed endpoint is a no-op.
    fn close(&self);

    /// Most recent frame, without waiting for the producer.
    fn latest_frame(&self) -> Option<Frame>;

    /// Request new dimensions; returns the dimensions actually applied
    /// after clamping to the source limits.
    fn set_size(&self, width: u32, height: u32) -> (u32, u32);

    /// Request a capture pacing.
    fn set_framerate(&self, framerate: u32);

    /// Capability/format description.
    fn caps(&self) -> String;
}

/// The host object graph as seen by scripts.
///
/// All data crosses as [`Value`]. Lookups of unknown objects return `None`
/// or `false`; nothing here panics or raises.
pub trait Host: Send + Sync {
    /// Names of all objects.
    fn list_objects(&self) -> Vec<String>;

    /// `(name, type)` for all objects.
    fn object_types(&self) -> Vec<(String, String)>;

    /// Type of one object.
    fn object_type(&self, object: &str) -> Option<String>;

    /// Names of objects of the given type.
    fn objects_of_type(&self, type_name: &str) -> Vec<String> {
        self.object_types()
            .into_iter()
            .filter(|(_, t)| t == type_name)
            .map(|(name, _)| name)
            .collect()
    }

    /// Read one attribute.
    fn get_attribute(&self, object: &str, attribute: &str) -> Option<Value>;

    /// Read every attribute of an object, in declaration order.
    fn get_attributes(&self, object: &str) -> Option<Vec<(String, Value)>>;

    /// Write one attribute. Returns `false` if the object or attribute is unknown.
    fn set_attribute(&self, object: &str, attribute: &str, value: Value) -> bool;

    /// Write a host-wide (root) attribute.
    fn set_global(&self, attribute: &str, value: Value) -> bool;

    /// Free-form description of an object.
    fn describe_object(&self, object: &str) -> Option<String>;

    /// Free-form description of one attribute.
    fn describe_attribute(&self, object: &str, attribute: &str) -> Option<String>;

    /// Objects this object is linked to.
    fn list_links(&self, object: &str) -> Option<Vec<String>>;

    /// Objects linking to this object.
    fn list_reverse_links(&self, object: &str) -> Option<Vec<String>>;

    /// Declare a new attribute on an object, initialised to `default`.
    fn add_custom_attribute(&self, object: &str, attribute: &str, default: Value) -> bool;

    /// Object types belonging to a category (e.g. "image", "mesh").
    fn types_in_category(&self, category: &str) -> Vec<String>;

    /// Install a change observer for `(object, attribute)`.
    ///
    /// Returns `None` if the pair does not exist. Implementations must not
    /// invoke the observer from inside `subscribe` itself.
    fn subscribe(
        &self,
        object: &str,
        attribute: &str,
        observer: AttributeObserver,
    ) -> Option<SubscriptionId>;

    /// Remove a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Create a new binding to the capture source `name`.
    ///
    /// Every call returns an independent binding.
    ///
    /// `NotFound` if no object has that name, `InvalidState` if the object
    /// exists but cannot produce frames.
    fn capture_endpoint(&self, name: &str) -> BridgeResult<Arc<dyn CaptureEndpoint>>;

    /// Recent host log lines.
    fn logs(&self) -> Value;

    /// Named timing measurements.
    fn timings(&self) -> Value;

    /// Master clock reading.
    fn master_clock(&self) -> Value;
}

/// Shared handle to a host implementation.
pub type SharedHost = Arc<dyn Host>;
