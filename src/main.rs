//! Stagescript demo runner.
//!
//! Runs a Lua script against an in-memory host that carries a small demo
//! scene and a synthetic capture source. See the `stagescript` library for
//! the bridge itself.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use stagescript::host::MemoryCapture;
use stagescript::{CallbackRegistry, Host, MemoryHost, Outcome, ScriptConfig, ScriptInstance, SharedHost, Value};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Name of the synthetic capture source.
const DEMO_SOURCE: &str = "main_view";

// CLI
#[derive(Parser)]
#[command(name = "stagescript")]
#[command(version)]
#[command(about = "Run Lua stage scripts against an in-memory host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script until Ctrl-C, the duration elapses, or the script fails
    Run {
        /// Script file (defaults to STAGE_SCRIPT_PATH)
        script: Option<PathBuf>,
        /// Update ticks per second
        #[arg(long)]
        rate: Option<u32>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
        /// Make attribute-callback errors fatal
        #[arg(long)]
        strict: bool,
        /// Argument passed to the script's init(args); repeatable
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Print the effective configuration as JSON
    Config,
}

/// Build the demo scene.
fn demo_host() -> (Arc<MemoryHost>, Arc<MemoryCapture>) {
    let host = Arc::new(MemoryHost::new());
    host.add_object(
        "camera",
        "camera",
        vec![
            ("position", Value::Seq(vec![0.0.into(), 0.0.into(), 5.0.into()])),
            ("fov", 50.0.into()),
            ("zoom", 1.0.into()),
        ],
    );
    host.add_object("key_light", "light", vec![("power", 100.into())]);
    host.add_object("fill_light", "light", vec![("power", 40.into())]);
    host.add_object("clock", "clock", vec![("frame", 0.into())]);
    host.add_type_to_category("lights", "light");
    host.add_link("camera", "key_light");
    let capture = host.add_capture_source(DEMO_SOURCE, 640, 360);
    host.log("info", "demo scene ready");
    (host, capture)
}

/// Produce frames on the demo source and advance `clock.frame`, until shutdown.
fn spawn_frame_generator(
    host: Arc<MemoryHost>,
    capture: Arc<MemoryCapture>,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("frame-generator".to_string())
        .spawn(move || {
            let mut frame: i64 = 0;
            while !stop.load(Ordering::Relaxed) {
                let started = Instant::now();
                let (width, height) = capture.size();
                let shade = (frame % 256) as u8;
                let pixels = vec![shade; (width as usize) * (height as usize) * 4];
                capture.push_frame(pixels);
                host.set_attribute("clock", "frame", Value::Int(frame));
                host.record_timing("frame_generation", started.elapsed().as_micros() as i64);
                frame += 1;

                let period = Duration::from_secs(1) / capture.framerate().max(1);
                thread::sleep(period.saturating_sub(started.elapsed()));
            }
        })?;
    Ok(handle)
}

fn run_script(
    script: Option<PathBuf>,
    rate: Option<u32>,
    duration: Option<f64>,
    strict: bool,
    args: Vec<String>,
) -> Result<()> {
    let mut config = ScriptConfig::from_env();
    if let Some(script) = script {
        config.script_path = Some(script);
    }
    if let Some(rate) = rate {
        config.update_rate = rate;
    }
    config.strict |= strict;

    let Some(path) = config.script_path.clone() else {
        bail!("No script given (pass a path or set STAGE_SCRIPT_PATH)");
    };

    ctrlc::set_handler(|| SHUTDOWN_FLAG.store(true, Ordering::SeqCst))?;

    let (host, capture) = demo_host();
    let generator_stop = Arc::new(AtomicBool::new(false));
    let generator = spawn_frame_generator(Arc::clone(&host), capture, Arc::clone(&generator_stop))?;

    let registry = CallbackRegistry::new(Arc::clone(&host) as SharedHost);
    let mut instance = ScriptInstance::with_config(registry, config);
    instance.set_args(args.into_iter().map(Value::from).collect());

    if instance.module_name().is_empty() {
        bail!("Script file not found: {}", path.display());
    }
    if !instance.run() {
        bail!("Script '{}' failed to start", instance.module_name());
    }
    println!(
        "Running '{}' at {} Hz (Ctrl-C to stop)",
        instance.module_name(),
        instance.update_rate()
    );

    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    while !SHUTDOWN_FLAG.load(Ordering::Relaxed)
        && instance.is_running()
        && deadline.map_or(true, |d| Instant::now() < d)
    {
        thread::sleep(Duration::from_millis(20));
    }

    instance.stop();
    let ticks = instance.tick_count();
    let outcome = instance.outcome().cloned();

    generator_stop.store(true, Ordering::Relaxed);
    if generator.join().is_err() {
        log::warn!("Frame generator panicked");
    }

    match outcome {
        Some(Outcome::Success) => {
            println!("Script finished after {} tick(s)", ticks);
            Ok(())
        }
        Some(Outcome::Failure(fault)) => {
            println!("Script failed after {} tick(s): {}", ticks, fault.message);
            if !fault.traceback.is_empty() {
                println!("{}", fault.traceback);
            }
            bail!("script failed")
        }
        None => bail!("Script ended without an outcome"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            rate,
            duration,
            strict,
            args,
        } => run_script(script, rate, duration, strict, args),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&ScriptConfig::from_env())?);
            Ok(())
        }
    }
}
