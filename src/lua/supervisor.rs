//! Process-wide runtime supervisor.
//!
//! Owns the shared global state every isolated context hangs off, the global
//! execution lock that serializes entry into any context, and the count of
//! live script instances. The global state is created lazily by the first
//! instance and torn down when the last one goes away.
//!
//! # Locking
//!
//! ```text
//! loop thread A ──lock()──┐
//! loop thread B ──lock()──┼──► ExecRegister { current: Option<ContextId> }
//! host thread   ──lock()──┘          │
//!                                    └── enter(&ctx) ─► ContextScope (restores on drop)
//! ```
//!
//! A thread that already holds the lock gets `InvalidState` from a second
//! [`RuntimeSupervisor::lock`] instead of deadlocking. Code that may run
//! either way uses [`RuntimeSupervisor::lock_or_defer`] and routes to an
//! enqueue when it returns `None`.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use mlua::{Lua, LuaOptions, StdLib};

use crate::error::{BridgeError, BridgeResult};

thread_local! {
    /// Address of the supervisor whose execution lock this thread holds, 0 if none.
    static HELD_LOCK: Cell<usize> = const { Cell::new(0) };
}

/// Identifies an isolated context across global-state generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    /// Global-state generation the context was created under.
    pub generation: u64,
    /// Index within that generation.
    pub index: u64,
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}.{}", self.generation, self.index)
    }
}

/// Shared runtime state. Outlives every context created under it.
#[derive(Debug)]
pub struct GlobalState {
    generation: u64,
    next_context: AtomicU64,
    live_contexts: AtomicUsize,
    started_at: Instant,
}

impl GlobalState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            next_context: AtomicU64::new(1),
            live_contexts: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }

    /// Initialization generation, bumped every time the state is recreated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of contexts currently alive under this state.
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }

    fn teardown(&self) {
        let live = self.live_contexts();
        if live > 0 {
            log::warn!(
                "Tearing down global script state generation {} with {} live context(s)",
                self.generation,
                live
            );
        }
        log::info!(
            "Global script state generation {} torn down after {:?}",
            self.generation,
            self.started_at.elapsed()
        );
    }
}

/// One isolated execution context: a private Lua state.
///
/// Scripts in different contexts share no globals. All calls into the
/// context must happen while the global execution lock is held.
pub struct IsolatedContext {
    id: ContextId,
    lua: Lua,
    global: Arc<GlobalState>,
}

impl IsolatedContext {
    /// Context identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The Lua state backing this context.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Global state this context was created under.
    pub fn global_state(&self) -> &Arc<GlobalState> {
        &self.global
    }
}

impl fmt::Debug for IsolatedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        self.global.live_contexts.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Released isolated context {}", self.id);
    }
}

#[derive(Debug, Default)]
struct ExecRegister {
    current: Option<ContextId>,
}

/// Proof that the calling thread holds the global execution lock.
pub struct ExecGuard<'a> {
    supervisor: &'a RuntimeSupervisor,
    register: MutexGuard<'a, ExecRegister>,
    previous_holder: usize,
}

impl ExecGuard<'_> {
    /// Context the register currently points at.
    pub fn current_context(&self) -> Option<ContextId> {
        self.register.current
    }

    /// Make `ctx` current until the returned scope drops.
    pub fn enter(&mut self, ctx: &IsolatedContext) -> ContextScope<'_> {
        let previous = self.register.current.replace(ctx.id());
        ContextScope {
            register: &mut *self.register,
            previous,
        }
    }
}

impl fmt::Debug for ExecGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecGuard")
            .field("current", &self.register.current)
            .finish_non_exhaustive()
    }
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        HELD_LOCK.with(|held| held.set(self.previous_holder));
        log::trace!(
            "Released execution lock ({} instance(s) live)",
            self.supervisor.instance_count()
        );
    }
}

/// Active context switch. Restores the previous register value on drop.
#[derive(Debug)]
pub struct ContextScope<'g> {
    register: &'g mut ExecRegister,
    previous: Option<ContextId>,
}

impl ContextScope<'_> {
    /// The context this scope made current.
    pub fn context_id(&self) -> Option<ContextId> {
        self.register.current
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        self.register.current = self.previous;
    }
}

/// Owner of the global state and the execution lock.
#[derive(Debug)]
pub struct RuntimeSupervisor {
    state: Mutex<Option<Arc<GlobalState>>>,
    exec: Mutex<ExecRegister>,
    instances: AtomicUsize,
    generation: AtomicU64,
}

impl RuntimeSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(None),
            exec: Mutex::new(ExecRegister::default()),
            instances: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// The process-wide supervisor.
    pub fn global() -> &'static Self {
        static SUPERVISOR: OnceLock<RuntimeSupervisor> = OnceLock::new();
        SUPERVISOR.get_or_init(Self::new)
    }

    fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Get the global state, creating it on first use.
    pub fn acquire_global_state(&self) -> Arc<GlobalState> {
        let mut slot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = slot.as_ref() {
            return Arc::clone(state);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(GlobalState::new(generation));
        log::info!("Initialized global script state (generation {})", generation);
        *slot = Some(Arc::clone(&state));
        state
    }

    /// Whether the global state is currently initialized.
    pub fn is_live(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of initializations so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether the calling thread holds this supervisor's execution lock.
    pub fn holds_lock(&self) -> bool {
        HELD_LOCK.with(|held| held.get() == self.address())
    }

    /// Acquire the global execution lock, blocking until it is free.
    ///
    /// Returns `InvalidState` if this thread already holds it.
    pub fn lock(&self) -> BridgeResult<ExecGuard<'_>> {
        if self.holds_lock() {
            return Err(BridgeError::invalid_state(
                "execution lock already held by this thread",
            ));
        }
        // A panic inside a tick poisons the mutex; the register itself is
        // always consistent, so keep going.
        let register = self.exec.lock().unwrap_or_else(PoisonError::into_inner);
        let previous_holder = HELD_LOCK.with(|held| held.replace(self.address()));
        Ok(ExecGuard {
            supervisor: self,
            register,
            previous_holder,
        })
    }

    /// Acquire the lock unless this thread already holds it.
    pub fn lock_or_defer(&self) -> Option<ExecGuard<'_>> {
        self.lock().ok()
    }

    /// Create a fresh isolated context under the global state.
    ///
    /// The guard proves the caller holds the execution lock.
    pub fn create_isolated_context(&self, _guard: &ExecGuard<'_>) -> BridgeResult<IsolatedContext> {
        let global = self.acquire_global_state();
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default()).map_err(|e| {
            BridgeError::AllocationFailure(format!("failed to create Lua state: {e}"))
        })?;
        let index = global.next_context.fetch_add(1, Ordering::SeqCst);
        global.live_contexts.fetch_add(1, Ordering::SeqCst);
        let id = ContextId {
            generation: global.generation,
            index,
        };
        log::debug!("Created isolated context {}", id);
        Ok(IsolatedContext { id, lua, global })
    }

    /// Record a new script instance. Returns the live count.
    pub fn instance_created(&self) -> usize {
        self.instances.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a destroyed script instance. Tears the global state down when
    /// the count reaches zero. Returns the live count.
    pub fn instance_destroyed(&self) -> usize {
        let previous = self
            .instances
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or_else(|n| n);
        let remaining = previous.saturating_sub(1);
        if remaining == 0 {
            let mut slot = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            // An instance may have been created while we waited for the slot.
            if self.instances.load(Ordering::SeqCst) == 0 {
                if let Some(state) = slot.take() {
                    state.teardown();
                }
            }
        }
        remaining
    }

    /// Number of live script instances.
    pub fn instance_count(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}
