//! Script instances: one Lua module, one isolated context, one loop thread.
//!
//! # Lifecycle
//!
//! ```text
//! new ──set_script_file──► configured ──run()──► running ──stop()──► stopped
//!                               ▲                   │                   │
//!                               │             update() fault            │
//!                               │                   ▼                   │
//!                               │               faulted ──stop()────────┤
//!                               └───────────────────────────────────────┘
//! ```
//!
//! `run()` loads the module on the calling thread under the execution lock
//! and calls its `init(args)`. If anything fails, the context and every
//! registration made so far are rolled back and no thread is spawned.
//! Otherwise a thread named `script-<module>` ticks `update()` at the
//! configured rate until [`ScriptInstance::stop`] is called or the script
//! faults. The terminal [`Outcome`] arrives over a oneshot channel.
//!
//! # Script shape
//!
//! ```lua
//! local M = {}
//! function M.init(args) end     -- optional
//! function M.update() end       -- required
//! function M.stop() end         -- optional, called when the loop ends
//! return M
//! ```
//!
//! Entry points are looked up on the table the module returns, then in the
//! script's globals.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mlua::prelude::*;
use tokio::sync::oneshot;

use crate::config::{clamp_update_rate, ScriptConfig};
use crate::error::{abort_on_allocation_failure, BridgeError, BridgeResult, ScriptFault};
use crate::lua::callbacks::{
    new_handler_table, new_inbox, CallbackRegistry, HandlerTable, Inbox, InstanceId, Pending,
};
use crate::lua::codec::to_lua;
use crate::lua::primitives::{self, SinkTracker, StageContext};
use crate::lua::supervisor::{IsolatedContext, RuntimeSupervisor};
use crate::value::Value;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Terminal result of a script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The loop ended because `stop()` was called.
    Success,
    /// The script raised an uncaught error.
    Failure(ScriptFault),
}

impl Outcome {
    /// Whether the run ended cleanly.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug)]
struct LoopShared {
    running: AtomicBool,
    stop_requested: AtomicBool,
    ticks: AtomicU64,
    rate: AtomicU32,
}

/// A loaded module, owned by the loop thread while it runs.
struct LoadedScript {
    // Lua references are declared before the context so they drop first.
    module: Option<LuaTable>,
    update: LuaFunction,
    stop: Option<LuaFunction>,
    handlers: HandlerTable,
    context: IsolatedContext,
}

fn lookup_function(lua: &Lua, module: Option<&LuaTable>, name: &str) -> Option<LuaFunction> {
    module
        .and_then(|table| table.get::<Option<LuaFunction>>(name).ok().flatten())
        .or_else(|| lua.globals().get::<Option<LuaFunction>>(name).ok().flatten())
}

impl LoadedScript {
    fn lua(&self) -> &Lua {
        self.context.lua()
    }

    /// One tick: queued work first, then `update()`.
    fn tick(&self, inbox: &Inbox, strict: bool, module: &str) -> Result<(), ScriptFault> {
        self.drain_inbox(inbox, strict, module)?;
        self.update
            .call::<()>(())
            .map_err(|e| fault_or_abort(&e))
    }

    fn drain_inbox(&self, inbox: &Inbox, strict: bool, module: &str) -> Result<(), ScriptFault> {
        let pending: Vec<Pending> = inbox
            .lock()
            .expect("inbox mutex poisoned")
            .drain(..)
            .collect();

        for item in pending {
            let (what, result) = match item {
                Pending::Attribute {
                    registration,
                    object,
                    attribute,
                    value,
                } => {
                    let handler = {
                        let handlers = self.handlers.lock().expect("handler table mutex poisoned");
                        handlers
                            .get(&registration)
                            .and_then(|key| self.lua().registry_value::<LuaFunction>(key).ok())
                    };
                    // Unregistered after the change was queued.
                    let Some(handler) = handler else { continue };
                    let result = to_lua(self.lua(), &value, false).and_then(|value| {
                        handler.call::<()>((object.as_str(), attribute.as_str(), value))
                    });
                    (format!("callback for {object}.{attribute}"), result)
                }
                Pending::Call { function, args } => {
                    let Some(func) = lookup_function(self.lua(), self.module.as_ref(), &function)
                    else {
                        log::warn!("[{}] call to undefined function '{}'", module, function);
                        continue;
                    };
                    let result = args
                        .iter()
                        .map(|arg| to_lua(self.lua(), arg, false))
                        .collect::<LuaResult<LuaMultiValue>>()
                        .and_then(|args| func.call::<()>(args));
                    (format!("call to '{function}'"), result)
                }
            };

            if let Err(e) = result {
                let fault = fault_or_abort(&e);
                if strict {
                    return Err(fault);
                }
                log::warn!("[{}] {} failed: {}", module, what, fault);
            }
        }
        Ok(())
    }
}

/// Script errors become faults. Running out of memory is not recoverable.
fn fault_or_abort(err: &LuaError) -> ScriptFault {
    if let LuaError::MemoryError(msg) = err {
        abort_on_allocation_failure(msg);
    }
    ScriptFault::from_lua_error(err)
}

fn fault_from(err: &BridgeError) -> ScriptFault {
    match err {
        BridgeError::ScriptFault(fault) => fault.clone(),
        other => ScriptFault {
            message: other.to_string(),
            traceback: String::new(),
        },
    }
}

/// Tick `update()` until stopped or faulted, then call the `stop` entry point.
fn run_loop(script: &LoadedScript, shared: &LoopShared, inbox: &Inbox, strict: bool, module: &str) -> Outcome {
    let supervisor = RuntimeSupervisor::global();
    let mut deadline = Instant::now();

    while shared.running.load(Ordering::SeqCst) && !shared.stop_requested.load(Ordering::SeqCst) {
        let result = match supervisor.lock() {
            Ok(mut guard) => {
                let _scope = guard.enter(&script.context);
                script.tick(inbox, strict, module)
            }
            Err(e) => Err(fault_from(&e)),
        };
        if let Err(fault) = result {
            log::error!("Script '{}' failed: {}", module, fault);
            return Outcome::Failure(fault);
        }
        shared.ticks.fetch_add(1, Ordering::SeqCst);

        // Absolute deadlines; after a stall, resume from now instead of bursting.
        let period = Duration::from_secs(1) / shared.rate.load(Ordering::SeqCst).max(1);
        deadline += period;
        let now = Instant::now();
        if deadline < now {
            deadline = now;
        }
        while !shared.stop_requested.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }

    if let Some(stop) = &script.stop {
        let result = match supervisor.lock() {
            Ok(mut guard) => {
                let _scope = guard.enter(&script.context);
                stop.call::<()>(()).map_err(|e| ScriptFault::from_lua_error(&e))
            }
            Err(e) => Err(fault_from(&e)),
        };
        if let Err(fault) = result {
            log::error!("Script '{}' failed in stop: {}", module, fault);
            return Outcome::Failure(fault);
        }
    }

    Outcome::Success
}

/// Configure `package.path` so `require` finds modules next to the script.
fn setup_package_path(lua: &Lua, dir: &Path) -> Result<()> {
    let package: LuaTable = lua
        .globals()
        .get("package")
        .map_err(|e| anyhow!("Failed to get package table: {e}"))?;

    let current_path: String = package
        .get("path")
        .map_err(|e| anyhow!("Failed to get package.path: {e}"))?;

    let new_path = format!(
        "{dir}/?.lua;{dir}/?/init.lua;{current}",
        dir = dir.display(),
        current = current_path
    );

    package
        .set("path", new_path)
        .map_err(|e| anyhow!("Failed to set package.path: {e}"))?;

    Ok(())
}

/// A script module bound to a host through a shared [`CallbackRegistry`].
pub struct ScriptInstance {
    id: InstanceId,
    registry: Arc<CallbackRegistry>,
    config: ScriptConfig,
    script_path: Option<PathBuf>,
    module_name: String,
    args: Vec<Value>,
    shared: Arc<LoopShared>,
    inbox: Inbox,
    sinks: SinkTracker,
    thread: Option<JoinHandle<LoadedScript>>,
    outcome_rx: Option<oneshot::Receiver<Outcome>>,
    outcome: Option<Outcome>,
}

impl fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("id", &self.id)
            .field("module_name", &self.module_name)
            .field("script_path", &self.script_path)
            .field("running", &self.is_running())
            .field("ticks", &self.tick_count())
            .finish_non_exhaustive()
    }
}

impl ScriptInstance {
    /// Create an instance with default configuration.
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self::with_config(registry, ScriptConfig::default())
    }

    /// Create an instance. Uses `config.script_path` if set.
    pub fn with_config(registry: Arc<CallbackRegistry>, config: ScriptConfig) -> Self {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::SeqCst);
        let live = RuntimeSupervisor::global().instance_created();
        log::debug!("Created script instance {} ({} live)", id, live);

        let rate = clamp_update_rate(config.update_rate);
        let mut instance = Self {
            id,
            registry,
            script_path: None,
            module_name: String::new(),
            args: Vec::new(),
            shared: Arc::new(LoopShared {
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                rate: AtomicU32::new(rate),
            }),
            inbox: new_inbox(),
            sinks: SinkTracker::new(),
            thread: None,
            outcome_rx: None,
            outcome: None,
            config,
        };
        if let Some(path) = instance.config.script_path.clone() {
            instance.set_script_file(path);
        }
        instance
    }

    /// Instance identifier.
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    /// Module name derived from the script file, empty until one is set.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// The registry this instance registers callbacks with.
    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Select the script file. Does not load it.
    ///
    /// Returns false if the file does not exist or cannot be read, or if the
    /// instance is running.
    pub fn set_script_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if self.thread.is_some() {
            log::warn!("Cannot change script of running instance {}", self.id);
            return false;
        }
        if !path.is_file() {
            log::warn!("{}", BridgeError::not_found(format!("script file {}", path.display())));
            return false;
        }
        if let Err(e) = std::fs::File::open(path) {
            log::warn!("Script file {} is not readable: {}", path.display(), e);
            return false;
        }
        let Some(stem) = path.file_stem() else {
            return false;
        };
        self.module_name = stem.to_string_lossy().into_owned();
        self.script_path = Some(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
        log::debug!("Instance {} uses module '{}'", self.id, self.module_name);
        true
    }

    /// Arguments passed to `init(args)` and exposed as `stage.args`.
    pub fn set_args(&mut self, args: Vec<Value>) {
        self.args = args;
    }

    /// Set the update rate in ticks per second. Applies immediately, also to
    /// a running loop. Returns the clamped rate.
    pub fn set_update_rate(&mut self, rate: u32) -> u32 {
        let rate = clamp_update_rate(rate);
        self.shared.rate.store(rate, Ordering::SeqCst);
        rate
    }

    /// Current update rate.
    pub fn update_rate(&self) -> u32 {
        self.shared.rate.load(Ordering::SeqCst)
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether a loop thread exists (running, or ended but not yet stopped).
    pub fn has_loop_thread(&self) -> bool {
        self.thread.is_some()
    }

    /// Number of completed `update()` calls in the current or last run.
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    /// Load the module, call `init(args)` and start the loop thread.
    ///
    /// Returns false, with nothing left behind, if the instance already has a
    /// loop thread, no script is set, or loading or `init` fails.
    pub fn run(&mut self) -> bool {
        if self.thread.is_some() {
            log::warn!("Script '{}' is already running", self.module_name);
            return false;
        }
        let Some(path) = self.script_path.clone() else {
            log::warn!("Instance {} has no script file", self.id);
            return false;
        };

        self.outcome = None;
        self.outcome_rx = None;

        match self.load(&path) {
            Ok(script) => self.spawn(script),
            Err(e) => {
                log::error!("Failed to start script '{}': {}", self.module_name, e);
                false
            }
        }
    }

    fn load(&self, path: &Path) -> Result<LoadedScript> {
        let rollback = {
            let registry = Arc::clone(&self.registry);
            let sinks = self.sinks.clone();
            let inbox = Arc::clone(&self.inbox);
            let id = self.id;
            scopeguard::guard((), move |()| {
                registry.sweep_owner(id);
                sinks.release_all();
                inbox.lock().expect("inbox mutex poisoned").clear();
            })
        };

        let supervisor = RuntimeSupervisor::global();
        let mut guard = supervisor.lock()?;
        let context = supervisor.create_isolated_context(&guard)?;
        let handlers = new_handler_table();

        let (module, update, stop) = {
            let _scope = guard.enter(&context);
            let lua = context.lua();

            let stage = StageContext {
                instance_id: self.id,
                module: self.module_name.clone(),
                registry: Arc::clone(&self.registry),
                inbox: Arc::clone(&self.inbox),
                handlers: Arc::clone(&handlers),
                sinks: self.sinks.clone(),
                args: self.args.clone(),
            };
            primitives::register_all(lua, &stage)?;

            if let Some(dir) = path.parent() {
                setup_package_path(lua, dir)?;
            }

            let require: LuaFunction = lua
                .globals()
                .get("require")
                .map_err(|e| anyhow!("Failed to get require: {e}"))?;
            let module = match require.call::<LuaValue>(self.module_name.as_str()) {
                Ok(LuaValue::Table(table)) => Some(table),
                Ok(_) => None,
                Err(e) => {
                    return Err(anyhow!(
                        "Failed to load module '{}': {}",
                        self.module_name,
                        ScriptFault::from_lua_error(&e)
                    ))
                }
            };

            let update = lookup_function(lua, module.as_ref(), "update")
                .ok_or_else(|| anyhow!("Module '{}' defines no update function", self.module_name))?;
            let stop = lookup_function(lua, module.as_ref(), "stop");

            if let Some(init) = lookup_function(lua, module.as_ref(), "init") {
                let args = to_lua(lua, &Value::Seq(self.args.clone()), false)
                    .map_err(|e| anyhow!("Failed to convert init arguments: {e}"))?;
                init.call::<()>(args).map_err(|e| {
                    anyhow!("init failed: {}", ScriptFault::from_lua_error(&e))
                })?;
            }

            (module, update, stop)
        };

        scopeguard::ScopeGuard::into_inner(rollback);
        Ok(LoadedScript {
            module,
            update,
            stop,
            handlers,
            context,
        })
    }

    fn spawn(&mut self, script: LoadedScript) -> bool {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let inbox = Arc::clone(&self.inbox);
        let registry = Arc::clone(&self.registry);
        let sinks = self.sinks.clone();
        let id = self.id;
        let strict = self.config.strict;
        let module = self.module_name.clone();

        shared.ticks.store(0, Ordering::SeqCst);
        shared.stop_requested.store(false, Ordering::SeqCst);
        shared.running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("script-{module}"))
            .spawn(move || {
                log::info!(
                    "Script '{}' running at {} Hz",
                    module,
                    shared.rate.load(Ordering::SeqCst)
                );
                let outcome = run_loop(&script, &shared, &inbox, strict, &module);
                shared.running.store(false, Ordering::SeqCst);
                if !outcome.is_success() {
                    // Nothing drains the inbox any more.
                    let callbacks = registry.sweep_owner(id);
                    let released = sinks.release_all();
                    inbox.lock().expect("inbox mutex poisoned").clear();
                    log::debug!(
                        "Script '{}' faulted; released {} callback(s), {} sink(s)",
                        module,
                        callbacks,
                        released
                    );
                }
                if tx.send(outcome).is_err() {
                    log::debug!("Outcome of '{}' had no receiver", module);
                }
                script
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.outcome_rx = Some(rx);
                true
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                log::error!("Failed to spawn thread for '{}': {}", self.module_name, e);
                self.release(None);
                false
            }
        }
    }

    /// Stop the loop, wait for the thread, and release the context, its
    /// callback registrations and its frame sinks.
    ///
    /// Must not be called from inside a script tick: the join would wait on
    /// the lock the caller holds. In that case the stop is only requested and
    /// the join happens on the next `stop()` or on drop.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let Some(handle) = self.thread.take() else {
            self.release(None);
            return;
        };
        handle.thread().unpark();

        if RuntimeSupervisor::global().holds_lock() {
            log::warn!(
                "stop() for '{}' called while holding the execution lock; join deferred",
                self.module_name
            );
            self.thread = Some(handle);
            self.release(None);
            return;
        }

        let script = match handle.join() {
            Ok(script) => Some(script),
            Err(_) => {
                log::error!("Script thread for '{}' panicked", self.module_name);
                None
            }
        };
        self.poll_outcome();
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Failure(ScriptFault {
                message: "script thread panicked".to_string(),
                traceback: String::new(),
            }));
        }
        self.release(script);
    }

    fn release(&mut self, script: Option<LoadedScript>) {
        let callbacks = self.registry.sweep_owner(self.id);
        let sinks = self.sinks.release_all();
        self.inbox.lock().expect("inbox mutex poisoned").clear();

        if let Some(script) = script {
            let supervisor = RuntimeSupervisor::global();
            let _guard = supervisor.lock_or_defer();
            drop(script);
            log::info!(
                "Script '{}' stopped after {} tick(s); released {} callback(s), {} sink(s)",
                self.module_name,
                self.tick_count(),
                callbacks,
                sinks
            );
        }
    }

    fn poll_outcome(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        let Some(rx) = self.outcome_rx.as_mut() else {
            return;
        };
        match rx.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                self.outcome_rx = None;
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => self.outcome_rx = None,
        }
    }

    /// Terminal outcome of the last run, once the loop has ended.
    pub fn outcome(&mut self) -> Option<&Outcome> {
        self.poll_outcome();
        self.outcome.as_ref()
    }

    /// Wait up to `timeout` for the loop to end on its own.
    pub fn wait_for_outcome(&mut self, timeout: Duration) -> Option<&Outcome> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_outcome();
            if self.outcome.is_some() || self.outcome_rx.is_none() || Instant::now() >= deadline {
                return self.outcome.as_ref();
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Ask the script to call `function(args...)` on its next tick.
    ///
    /// `InvalidState` if the instance is not running.
    pub fn call(&self, function: &str, args: Vec<Value>) -> BridgeResult<()> {
        if !self.is_running() {
            return Err(BridgeError::invalid_state(format!(
                "script '{}' is not running",
                self.module_name
            )));
        }
        self.inbox
            .lock()
            .expect("inbox mutex poisoned")
            .push_back(Pending::Call {
                function: function.to_string(),
                args,
            });
        Ok(())
    }
}

impl Drop for ScriptInstance {
    fn drop(&mut self) {
        self.stop();
        let live = RuntimeSupervisor::global().instance_destroyed();
        log::debug!("Destroyed script instance {} ({} live)", self.id, live);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryHost, SharedHost};
    use std::io::Write;

    fn registry() -> Arc<CallbackRegistry> {
        CallbackRegistry::new(Arc::new(MemoryHost::new()) as SharedHost)
    }

    fn script(dir: &tempfile::TempDir, name: &str, source: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(source.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_set_script_file_missing() {
        let mut instance = ScriptInstance::new(registry());
        assert!(!instance.set_script_file("/nonexistent/script.lua"));
        assert_eq!(instance.module_name(), "");
        assert!(!instance.run());
    }

    #[test]
    fn test_module_name_from_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "spinner.lua", "function update() end");
        let mut instance = ScriptInstance::new(registry());
        assert!(instance.set_script_file(&path));
        assert_eq!(instance.module_name(), "spinner");
    }

    #[test]
    fn test_update_rate_is_clamped() {
        let mut instance = ScriptInstance::new(registry());
        assert_eq!(instance.update_rate(), 200);
        assert_eq!(instance.set_update_rate(0), 1);
        assert_eq!(instance.set_update_rate(5000), 1000);
        assert_eq!(instance.set_update_rate(30), 30);
    }

    #[test]
    fn test_call_requires_running() {
        let instance = ScriptInstance::new(registry());
        assert!(matches!(
            instance.call("anything", vec![]),
            Err(BridgeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_missing_update_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "noupdate.lua", "local M = {} function M.init() end return M");
        let mut instance = ScriptInstance::new(registry());
        assert!(instance.set_script_file(&path));
        assert!(!instance.run());
        assert!(!instance.has_loop_thread());
        assert!(!instance.is_running());
    }

    #[test]
    fn test_globals_fallback_and_stop_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            &dir,
            "globals.lua",
            r#"
            function init(args) stage.set_global("init_arg", args[1]) end
            function update() end
            function stop() stage.set_global("stopped", true) end
        "#,
        );
        let host = Arc::new(MemoryHost::new());
        let registry = CallbackRegistry::new(Arc::clone(&host) as SharedHost);
        let mut instance = ScriptInstance::new(registry);
        instance.set_args(vec![Value::from("hello")]);
        assert!(instance.set_script_file(&path));
        assert!(instance.run());
        instance.stop();
        assert_eq!(instance.outcome(), Some(&Outcome::Success));
        assert_eq!(host.global("init_arg"), Some(Value::from("hello")));
        assert_eq!(host.global("stopped"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_require_sibling_module() {
        let dir = tempfile::tempdir().unwrap();
        script(&dir, "helper.lua", "return { answer = 42 }");
        let path = script(
            &dir,
            "main.lua",
            r#"
            local helper = require("helper")
            local M = {}
            function M.init() stage.set_global("answer", helper.answer) end
            function M.update() end
            return M
        "#,
        );
        let host = Arc::new(MemoryHost::new());
        let registry = CallbackRegistry::new(Arc::clone(&host) as SharedHost);
        let mut instance = ScriptInstance::new(registry);
        assert!(instance.set_script_file(&path));
        assert!(instance.run());
        instance.stop();
        assert_eq!(host.global("answer"), Some(Value::from(42)));
    }
}
