//! Attribute-change callback registry.
//!
//! Scripts register interest in `(object, attribute)` pairs. The registry is
//! shared by every instance bound to the same host and holds one host
//! subscription per pair, however many scripts watch it.
//!
//! Dispatch is deferred: a host change notification only pushes a
//! [`Pending::Attribute`] message onto the owning instance's inbox. The
//! instance's loop thread drains the inbox at the start of its next tick,
//! under the execution lock, and calls the Lua handler there. Dispatch
//! therefore never runs script code and never touches the execution lock,
//! whichever thread the host notifies from.
//!
//! Lua handler functions live in the owning Lua state (see [`HandlerTable`]);
//! the registry only knows registration ids.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{BridgeError, BridgeResult};
use crate::host::{AttributeObserver, SharedHost, SubscriptionId};
use crate::value::Value;

/// Script instance identifier.
pub type InstanceId = u64;

/// Callback registration identifier, unique per registry.
pub type RegistrationId = u64;

/// Work queued for a script instance, executed on its next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// An observed attribute changed.
    Attribute {
        /// Registration whose handler should run.
        registration: RegistrationId,
        /// Object that changed.
        object: String,
        /// Attribute that changed.
        attribute: String,
        /// New value.
        value: Value,
    },
    /// Host-requested call of a script function.
    Call {
        /// Function name (module table first, then globals).
        function: String,
        /// Arguments.
        args: Vec<Value>,
    },
}

/// Per-instance message queue.
pub type Inbox = Arc<Mutex<VecDeque<Pending>>>;

/// Create an empty inbox.
pub fn new_inbox() -> Inbox {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Lua handler functions of one instance, keyed by registration id.
pub type HandlerTable = Arc<Mutex<HashMap<RegistrationId, mlua::RegistryKey>>>;

/// Create an empty handler table.
pub fn new_handler_table() -> HandlerTable {
    Arc::new(Mutex::new(HashMap::new()))
}

struct Registration {
    object: String,
    attribute: String,
    owner: InstanceId,
    inbox: Inbox,
}

struct PairSubscription {
    host_id: SubscriptionId,
    watchers: usize,
}

#[derive(Default)]
struct RegistryInner {
    // BTreeMap so that iteration follows id order, i.e. registration order.
    entries: BTreeMap<RegistrationId, Registration>,
    pairs: HashMap<(String, String), PairSubscription>,
    next_id: RegistrationId,
}

/// Shared table of attribute callbacks for one host.
pub struct CallbackRegistry {
    host: SharedHost,
    inner: Mutex<RegistryInner>,
    self_ref: Weak<CallbackRegistry>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl CallbackRegistry {
    /// Create a registry bound to `host`.
    pub fn new(host: SharedHost) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            host,
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                ..RegistryInner::default()
            }),
            self_ref: weak.clone(),
        })
    }

    /// The host this registry subscribes to.
    pub fn host(&self) -> &SharedHost {
        &self.host
    }

    /// Register `owner`'s interest in `(object, attribute)`.
    ///
    /// Installs a host subscription if this is the first registration for
    /// the pair. `NotFound` if the host does not know the pair.
    pub fn register(
        &self,
        object: &str,
        attribute: &str,
        owner: InstanceId,
        inbox: &Inbox,
    ) -> BridgeResult<RegistrationId> {
        self.register_with(object, attribute, owner, inbox, |_| {})
    }

    /// Like [`register`](Self::register), but runs `install` with the new id
    /// before the registration becomes visible to [`dispatch`](Self::dispatch).
    ///
    /// `install` runs under the registry mutex and must not call back into
    /// the registry. It is not called when registration fails.
    pub fn register_with(
        &self,
        object: &str,
        attribute: &str,
        owner: InstanceId,
        inbox: &Inbox,
        install: impl FnOnce(RegistrationId),
    ) -> BridgeResult<RegistrationId> {
        let mut inner = self.inner.lock().expect("callback registry mutex poisoned");
        let key = (object.to_string(), attribute.to_string());

        if let Some(pair) = inner.pairs.get_mut(&key) {
            pair.watchers += 1;
        } else {
            let weak = self.self_ref.clone();
            let observer: AttributeObserver =
                Arc::new(move |object: &str, attribute: &str, value: &Value| {
                    if let Some(registry) = weak.upgrade() {
                        registry.dispatch(object, attribute, value);
                    }
                });
            let host_id = self
                .host
                .subscribe(object, attribute, observer)
                .ok_or_else(|| {
                    BridgeError::not_found(format!("attribute '{object}.{attribute}'"))
                })?;
            inner.pairs.insert(
                key,
                PairSubscription {
                    host_id,
                    watchers: 1,
                },
            );
        }

        let id = inner.next_id;
        inner.next_id += 1;
        install(id);
        inner.entries.insert(
            id,
            Registration {
                object: object.to_string(),
                attribute: attribute.to_string(),
                owner,
                inbox: Arc::clone(inbox),
            },
        );
        log::debug!(
            "Registered attribute callback {} on {}.{} for instance {}",
            id,
            object,
            attribute,
            owner
        );
        Ok(id)
    }

    /// Remove a registration. Unknown ids are a no-op returning false.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut inner = self.inner.lock().expect("callback registry mutex poisoned");
        let Some(entry) = inner.entries.remove(&id) else {
            return false;
        };
        self.release_pair(&mut inner, entry.object, entry.attribute);
        log::debug!("Unregistered attribute callback {}", id);
        true
    }

    /// Owner of a registration, if it exists.
    pub fn owner_of(&self, id: RegistrationId) -> Option<InstanceId> {
        let inner = self.inner.lock().expect("callback registry mutex poisoned");
        inner.entries.get(&id).map(|entry| entry.owner)
    }

    /// Queue a change notification for every matching registration, in
    /// registration order. Returns how many messages were queued.
    pub fn dispatch(&self, object: &str, attribute: &str, value: &Value) -> usize {
        let inner = self.inner.lock().expect("callback registry mutex poisoned");
        let mut queued = 0;
        for (id, entry) in &inner.entries {
            if entry.object != object || entry.attribute != attribute {
                continue;
            }
            entry
                .inbox
                .lock()
                .expect("inbox mutex poisoned")
                .push_back(Pending::Attribute {
                    registration: *id,
                    object: object.to_string(),
                    attribute: attribute.to_string(),
                    value: value.clone(),
                });
            queued += 1;
        }
        if queued > 0 {
            log::trace!("Queued {} callback(s) for {}.{}", queued, object, attribute);
        }
        queued
    }

    /// Remove every registration of `owner`. Returns how many were removed.
    pub fn sweep_owner(&self, owner: InstanceId) -> usize {
        let mut inner = self.inner.lock().expect("callback registry mutex poisoned");
        let ids: Vec<RegistrationId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = inner.entries.remove(id) {
                self.release_pair(&mut inner, entry.object, entry.attribute);
            }
        }
        if !ids.is_empty() {
            log::debug!("Swept {} callback(s) of instance {}", ids.len(), owner);
        }
        ids.len()
    }

    /// Number of registrations held by `owner`.
    pub fn count_for_owner(&self, owner: InstanceId) -> usize {
        let inner = self.inner.lock().expect("callback registry mutex poisoned");
        inner.entries.values().filter(|e| e.owner == owner).count()
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("callback registry mutex poisoned")
            .entries
            .len()
    }

    /// Whether the registry holds no registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release_pair(&self, inner: &mut RegistryInner, object: String, attribute: String) {
        let key = (object, attribute);
        let Some(pair) = inner.pairs.get_mut(&key) else {
            return;
        };
        pair.watchers -= 1;
        if pair.watchers == 0 {
            if let Some(pair) = inner.pairs.remove(&key) {
                self.host.unsubscribe(pair.host_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, MemoryHost};

    fn setup() -> (Arc<MemoryHost>, Arc<CallbackRegistry>) {
        let host = Arc::new(MemoryHost::new());
        host.add_object("camera", "camera", vec![("zoom", Value::from(1.0))]);
        host.add_object("light", "light", vec![("power", Value::from(10))]);
        let registry = CallbackRegistry::new(Arc::clone(&host) as SharedHost);
        (host, registry)
    }

    fn drain(inbox: &Inbox) -> Vec<Pending> {
        inbox.lock().unwrap().drain(..).collect()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let (host, registry) = setup();
        let inbox = new_inbox();
        let h1 = registry.register("camera", "zoom", 1, &inbox).unwrap();
        let h2 = registry.register("camera", "zoom", 1, &inbox).unwrap();
        let h3 = registry.register("camera", "zoom", 1, &inbox).unwrap();

        assert!(host.set_attribute("camera", "zoom", Value::from(2.0)));

        let order: Vec<RegistrationId> = drain(&inbox)
            .into_iter()
            .map(|p| match p {
                Pending::Attribute { registration, value, .. } => {
                    assert_eq!(value, Value::from(2.0));
                    registration
                }
                Pending::Call { .. } => panic!("unexpected call"),
            })
            .collect();
        assert_eq!(order, vec![h1, h2, h3]);
    }

    #[test]
    fn test_one_host_subscription_per_pair() {
        let (host, registry) = setup();
        let inbox = new_inbox();
        let a = registry.register("camera", "zoom", 1, &inbox).unwrap();
        let b = registry.register("camera", "zoom", 2, &inbox).unwrap();
        registry.register("light", "power", 2, &inbox).unwrap();
        assert_eq!(host.subscription_count(), 2);

        assert!(registry.unregister(a));
        assert_eq!(host.subscription_count(), 2);
        assert!(registry.unregister(b));
        assert_eq!(host.subscription_count(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (_host, registry) = setup();
        let inbox = new_inbox();
        let id = registry.register("camera", "zoom", 1, &inbox).unwrap();
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(!registry.unregister(9999));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_pair_is_not_found() {
        let (_host, registry) = setup();
        let inbox = new_inbox();
        let err = registry.register("camera", "missing", 1, &inbox).unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_with_installs_before_visible() {
        let (_host, registry) = setup();
        let inbox = new_inbox();
        let installed = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&installed);
        let id = registry
            .register_with("camera", "zoom", 1, &inbox, move |id| {
                seen.lock().unwrap().push(id);
            })
            .unwrap();
        assert_eq!(*installed.lock().unwrap(), vec![id]);

        let seen = Arc::clone(&installed);
        let err = registry
            .register_with("camera", "missing", 1, &inbox, move |id| {
                seen.lock().unwrap().push(id);
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
        assert_eq!(installed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_owner_releases_subscriptions() {
        let (host, registry) = setup();
        let mine = new_inbox();
        let theirs = new_inbox();
        registry.register("camera", "zoom", 1, &mine).unwrap();
        registry.register("light", "power", 1, &mine).unwrap();
        registry.register("light", "power", 2, &theirs).unwrap();

        assert_eq!(registry.sweep_owner(1), 2);
        assert_eq!(registry.count_for_owner(1), 0);
        assert_eq!(registry.count_for_owner(2), 1);
        assert_eq!(host.subscription_count(), 1);

        host.set_attribute("camera", "zoom", Value::from(3.0));
        host.set_attribute("light", "power", Value::from(5));
        assert!(drain(&mine).is_empty());
        assert_eq!(drain(&theirs).len(), 1);
    }

    #[test]
    fn test_dispatch_routes_to_owner_inbox() {
        let (_host, registry) = setup();
        let first = new_inbox();
        let second = new_inbox();
        let id = registry.register("camera", "zoom", 1, &first).unwrap();
        registry.register("light", "power", 2, &second).unwrap();

        assert_eq!(registry.dispatch("camera", "zoom", &Value::from(4.0)), 1);
        assert_eq!(registry.owner_of(id), Some(1));
        assert_eq!(drain(&first).len(), 1);
        assert!(drain(&second).is_empty());
    }
}
