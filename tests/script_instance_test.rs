//! Integration tests for script instances.
//!
//! Each test writes its script into a temp dir, runs it against a
//! `MemoryHost`, and observes the effects through the host.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stagescript::{
    CallbackRegistry, Host, MemoryHost, Outcome, ScriptConfig, ScriptInstance, SharedHost, Value,
};
use tempfile::TempDir;

struct Fixture {
    host: Arc<MemoryHost>,
    registry: Arc<CallbackRegistry>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let host = Arc::new(MemoryHost::new());
        host.add_object(
            "camera",
            "camera",
            vec![("zoom", Value::from(1.0)), ("fov", Value::from(50.0))],
        );
        let registry = CallbackRegistry::new(Arc::clone(&host) as SharedHost);
        Self {
            host,
            registry,
            dir: TempDir::new().unwrap(),
        }
    }

    fn script(&self, name: &str, source: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{name}.lua"));
        std::fs::write(&path, source).unwrap();
        path
    }

    fn instance(&self, name: &str, source: &str) -> ScriptInstance {
        self.instance_with(name, source, ScriptConfig::default())
    }

    fn instance_with(&self, name: &str, source: &str, config: ScriptConfig) -> ScriptInstance {
        let path = self.script(name, source);
        let mut instance = ScriptInstance::with_config(Arc::clone(&self.registry), config);
        assert!(instance.set_script_file(&path));
        instance
    }

    fn wait_for_global(&self, name: &str, expected: &Value) -> bool {
        wait_until(Duration::from_secs(3), || {
            self.host.global(name).as_ref() == Some(expected)
        })
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

const TICKER: &str = r#"
local M = {}
function M.update() end
return M
"#;

#[test]
fn test_run_and_stop_lifecycle() {
    let fx = Fixture::new();
    let mut instance = fx.instance("ticker", TICKER);

    assert!(instance.run());
    assert!(instance.is_running());
    assert!(instance.has_loop_thread());
    assert!(wait_until(Duration::from_secs(2), || instance.tick_count() > 0));

    // At most one loop thread per instance.
    assert!(!instance.run());

    instance.stop();
    assert!(!instance.is_running());
    assert!(!instance.has_loop_thread());
    assert_eq!(instance.outcome(), Some(&Outcome::Success));

    // Stop is repeatable, and the instance can run again.
    instance.stop();
    assert!(instance.run());
    instance.stop();
    assert_eq!(instance.outcome(), Some(&Outcome::Success));
}

#[test]
fn test_missing_script_file() {
    let fx = Fixture::new();
    let mut instance = ScriptInstance::new(Arc::clone(&fx.registry));
    assert!(!instance.set_script_file(fx.dir.path().join("absent.lua")));
    assert!(!instance.run());
    assert!(!instance.has_loop_thread());
}

#[test]
fn test_init_error_rolls_back() {
    let fx = Fixture::new();
    fx.host.add_capture_source("view", 64, 64);
    let mut instance = fx.instance(
        "broken_init",
        r#"
        local M = {}
        function M.init()
            stage.register_attribute_callback("camera", "zoom", function() end)
            local sink = stage.Sink{ source = "view" }
            sink:open()
            error("init exploded")
        end
        function M.update() end
        return M
    "#,
    );

    assert!(!instance.run());
    assert!(!instance.is_running());
    assert!(!instance.has_loop_thread());
    assert_eq!(fx.registry.count_for_owner(instance.instance_id()), 0);
    assert_eq!(fx.host.subscription_count(), 0);
    assert_eq!(fx.host.open_capture_count(), 0);
}

#[test]
fn test_syntax_error_fails_run() {
    let fx = Fixture::new();
    let mut instance = fx.instance("bad_syntax", "function update( end");
    assert!(!instance.run());
    assert!(!instance.has_loop_thread());
}

#[test]
fn test_update_rate_pacing() {
    let fx = Fixture::new();
    let mut instance = fx.instance("paced", TICKER);
    instance.set_update_rate(10);

    assert!(instance.run());
    thread::sleep(Duration::from_secs(1));
    instance.stop();

    let ticks = instance.tick_count();
    assert!((9..=11).contains(&ticks), "expected 9-11 ticks, got {ticks}");
}

#[test]
fn test_fault_isolation() {
    let fx = Fixture::new();
    let mut faulty = fx.instance(
        "faulty",
        r#"
        local M = {}
        local n = 0
        function M.update()
            n = n + 1
            if n == 5 then error("boom") end
        end
        return M
    "#,
    );
    let mut healthy = fx.instance("healthy", TICKER);

    assert!(faulty.run());
    assert!(healthy.run());

    let outcome = faulty.wait_for_outcome(Duration::from_secs(3)).cloned();
    match outcome {
        Some(Outcome::Failure(fault)) => assert!(fault.message.contains("boom"), "{fault}"),
        other => panic!("expected a failure, got {other:?}"),
    }
    assert!(!faulty.is_running());
    assert_eq!(faulty.tick_count(), 4);

    let before = healthy.tick_count();
    assert!(wait_until(Duration::from_secs(2), || healthy.tick_count() > before));
    assert!(healthy.is_running());

    faulty.stop();
    assert!(matches!(faulty.outcome(), Some(Outcome::Failure(_))));
    healthy.stop();
    assert_eq!(healthy.outcome(), Some(&Outcome::Success));
}

#[test]
fn test_fault_releases_callbacks_and_sinks() {
    let fx = Fixture::new();
    fx.host.add_capture_source("view", 64, 64);
    let mut instance = fx.instance(
        "fails_later",
        r#"
        local M = {}
        local sink
        function M.init()
            stage.register_attribute_callback("camera", "zoom", function() end)
            sink = stage.Sink{ source = "view" }
            sink:open()
        end
        function M.update()
            error("update exploded")
        end
        return M
    "#,
    );

    assert!(instance.run());
    let outcome = instance.wait_for_outcome(Duration::from_secs(3)).cloned();
    assert!(matches!(outcome, Some(Outcome::Failure(_))), "{outcome:?}");

    // Released before the outcome was delivered, without calling stop().
    assert!(instance.has_loop_thread());
    assert_eq!(fx.registry.count_for_owner(instance.instance_id()), 0);
    assert_eq!(fx.host.subscription_count(), 0);
    assert_eq!(fx.host.open_capture_count(), 0);

    // Later changes have nowhere to go.
    assert!(fx.host.set_attribute("camera", "zoom", Value::from(3.0)));
    assert_eq!(fx.registry.dispatch("camera", "zoom", &Value::from(4.0)), 0);

    instance.stop();
    assert!(matches!(instance.outcome(), Some(Outcome::Failure(_))));
}

#[test]
fn test_callbacks_fire_in_registration_order() {
    let fx = Fixture::new();
    let mut instance = fx.instance(
        "ordered",
        r#"
        local M = {}
        local seen = {}
        local function record(tag)
            return function(object, attribute, value)
                seen[#seen + 1] = tag
                stage.set_global("last_change", object .. "." .. attribute .. "=" .. tostring(value))
            end
        end
        function M.init()
            assert(stage.register_attribute_callback("camera", "zoom", record("H1")))
            assert(stage.register_attribute_callback("camera", "zoom", record("H2")))
            assert(stage.register_attribute_callback("camera", "zoom", record("H3")))
        end
        function M.update()
            if #seen == 3 then
                stage.set_global("order", table.concat(seen, ","))
            end
        end
        return M
    "#,
    );

    assert!(instance.run());
    assert!(fx.host.set_attribute("camera", "zoom", Value::from(2.5)));

    assert!(fx.wait_for_global("order", &Value::from("H1,H2,H3")));
    assert_eq!(fx.host.global("last_change"), Some(Value::from("camera.zoom=2.5")));
    instance.stop();
}

#[test]
fn test_callback_errors_are_logged_unless_strict() {
    let fx = Fixture::new();
    let source = r#"
        local M = {}
        function M.init()
            stage.register_attribute_callback("camera", "fov", function() error("bad handler") end)
        end
        function M.update() end
        return M
    "#;

    let mut lenient = fx.instance("lenient", source);
    let mut strict = fx.instance_with(
        "strict",
        source,
        ScriptConfig {
            strict: true,
            ..ScriptConfig::default()
        },
    );
    assert!(lenient.run());
    assert!(strict.run());

    fx.host.set_attribute("camera", "fov", Value::from(60.0));

    let outcome = strict.wait_for_outcome(Duration::from_secs(3)).cloned();
    match outcome {
        Some(Outcome::Failure(fault)) => assert!(fault.message.contains("bad handler"), "{fault}"),
        other => panic!("expected a failure, got {other:?}"),
    }

    let before = lenient.tick_count();
    assert!(wait_until(Duration::from_secs(2), || lenient.tick_count() > before + 2));
    assert!(lenient.is_running());

    lenient.stop();
    strict.stop();
}

#[test]
fn test_teardown_sweeps_callbacks_and_sinks() {
    let fx = Fixture::new();
    fx.host.add_capture_source("view", 128, 128);
    let mut instance = fx.instance(
        "leaky",
        r#"
        sink = stage.Sink{ source = "view" }
        function init()
            stage.register_attribute_callback("camera", "zoom", function() end)
            stage.register_attribute_callback("camera", "fov", function() end)
            assert(sink:open())
        end
        function update() end
    "#,
    );

    assert!(instance.run());
    assert_eq!(fx.registry.count_for_owner(instance.instance_id()), 2);
    assert_eq!(fx.host.subscription_count(), 2);
    assert_eq!(fx.host.open_capture_count(), 1);

    instance.stop();
    assert!(fx.registry.is_empty());
    assert_eq!(fx.host.subscription_count(), 0);
    assert_eq!(fx.host.open_capture_count(), 0);

    // Changes after teardown reach nobody.
    assert!(fx.host.set_attribute("camera", "zoom", Value::from(9.0)));
}

#[test]
fn test_drop_while_running_releases_everything() {
    let fx = Fixture::new();
    fx.host.add_capture_source("view", 128, 128);
    {
        let mut instance = fx.instance(
            "dropped",
            r#"
            local M = {}
            local sink
            function M.init()
                stage.register_attribute_callback("camera", "zoom", function() end)
                sink = stage.Sink{ source = "view" }
                sink:open()
            end
            function M.update() end
            return M
        "#,
        );
        assert!(instance.run());
        assert_eq!(fx.host.open_capture_count(), 1);
    }
    assert!(fx.registry.is_empty());
    assert_eq!(fx.host.open_capture_count(), 0);
}

#[test]
fn test_capture_grab_sequence() {
    let fx = Fixture::new();
    let source = fx.host.add_capture_source("view", 256, 256);
    let mut instance = fx.instance(
        "grabber",
        r#"
        local M = {}
        local sink
        local grabs = 0
        function M.init()
            sink = stage.Sink{ source = "view", width = 32, height = 32 }
            assert(sink:open())
        end
        function M.grab_now()
            local frame = sink:grab()
            grabs = grabs + 1
            stage.set_global("grab", frame and frame:bytes() or "nil")
            stage.set_global("grabs", grabs)
        end
        function M.update() end
        return M
    "#,
    );
    assert!(instance.run());

    // Before the first frame.
    instance.call("grab_now", vec![]).unwrap();
    assert!(fx.wait_for_global("grabs", &Value::from(1)));
    assert_eq!(fx.host.global("grab"), Some(Value::from("nil")));

    // After a frame is produced.
    source.push_frame(&b"frame-1"[..]);
    instance.call("grab_now", vec![]).unwrap();
    assert!(fx.wait_for_global("grabs", &Value::from(2)));
    assert_eq!(fx.host.global("grab"), Some(Value::from("frame-1")));

    // No new frame: the same frame again.
    instance.call("grab_now", vec![]).unwrap();
    assert!(fx.wait_for_global("grabs", &Value::from(3)));
    assert_eq!(fx.host.global("grab"), Some(Value::from("frame-1")));

    instance.stop();
    assert_eq!(fx.host.open_capture_count(), 0);
}

#[test]
fn test_call_passes_arguments() {
    let fx = Fixture::new();
    let mut instance = fx.instance(
        "callee",
        r#"
        function set_zoom(value, label)
            stage.set_object_attribute("camera", "zoom", value)
            stage.set_global("label", label)
        end
        function update() end
    "#,
    );
    assert!(instance.run());
    instance
        .call("set_zoom", vec![Value::from(3.5), Value::from("close-up")])
        .unwrap();
    assert!(fx.wait_for_global("label", &Value::from("close-up")));
    assert_eq!(fx.host.get_attribute("camera", "zoom"), Some(Value::from(3.5)));

    // Unknown functions are skipped, the instance keeps running.
    instance.call("missing", vec![]).unwrap();
    let before = instance.tick_count();
    assert!(wait_until(Duration::from_secs(2), || instance.tick_count() > before + 1));
    assert!(instance.is_running());

    instance.stop();
    assert!(instance.call("set_zoom", vec![]).is_err());
}

#[test]
fn test_instances_do_not_share_globals() {
    let fx = Fixture::new();
    let writer = r#"
        counter = (counter or 0) + 1
        function update() end
        function init() stage.set_global("counter_" .. stage.instance_id, counter) end
    "#;
    let mut a = fx.instance("iso_a", writer);
    let mut b = fx.instance("iso_b", writer);
    assert!(a.run());
    assert!(b.run());

    let key_a = format!("counter_{}", a.instance_id());
    let key_b = format!("counter_{}", b.instance_id());
    assert_eq!(fx.host.global(&key_a), Some(Value::from(1)));
    assert_eq!(fx.host.global(&key_b), Some(Value::from(1)));

    a.stop();
    b.stop();
}
