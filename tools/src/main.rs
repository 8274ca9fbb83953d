mod png_renderer;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use loader_core::synthetic::{synthetic_payload, SyntheticRenderer};
use loader_core::{
    Bitmap, ContentIdentity, LoaderConfig, LoaderEngine, Notification, Priority, Renderer,
};

use crate::png_renderer::PngRenderer;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_IO: i32 = 10;
const EXIT_CONFIG: i32 = 11;
const EXIT_ENGINE: i32 = 12;
const EXIT_TIMEOUT: i32 = 13;

#[derive(Parser)]
#[command(name = "tools", version, about = "Progressive loader tools CLI")]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the content identity of each file.
    Identity(IdentityArgs),
    /// Load PNG files through the engine and report every delivered render.
    Probe(ProbeArgs),
    /// Push synthetic payloads through the engine and report timings.
    Bench(BenchArgs),
}

#[derive(Parser)]
struct IdentityArgs {
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
}

#[derive(Parser)]
struct ProbeArgs {
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    priority: PriorityArg,

    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PX")]
    preview: Option<u32>,

    #[arg(long)]
    max_images: Option<usize>,

    #[arg(long)]
    max_bytes: Option<usize>,

    #[arg(long)]
    batch_quantity: Option<usize>,

    #[arg(long, value_name = "MS")]
    batch_ms: Option<u64>,

    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Parser)]
struct BenchArgs {
    #[arg(long, default_value_t = 64)]
    count: usize,

    #[arg(long, default_value_t = 2048)]
    width: u32,

    #[arg(long, default_value_t = 1536)]
    height: u32,

    #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
    priority: PriorityArg,

    #[arg(long)]
    critical_workers: Option<usize>,

    #[arg(long, default_value_t = 0, value_name = "MS")]
    delay_ms: u64,

    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

#[derive(ValueEnum, Clone, Copy)]
enum PriorityArg {
    Critical,
    High,
    Medium,
    Low,
    Prospective,
}

impl PriorityArg {
    fn priority(self) -> Priority {
        match self {
            PriorityArg::Critical => Priority::Critical,
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
            PriorityArg::Prospective => Priority::Prospective,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    loader_core::logging::init(level);
    loader_core::observability::install_panic_hook();
    let exit_code = match cli.command {
        Commands::Identity(args) => run_identity(args),
        Commands::Probe(args) => run_probe(args),
        Commands::Bench(args) => run_bench(args),
    };
    std::process::exit(exit_code);
}

fn read_payload(path: &Path) -> Result<Vec<u8>, i32> {
    std::fs::read(path).map_err(|err| {
        eprintln!("failed to read {}: {}", path.display(), err);
        EXIT_IO
    })
}

fn run_identity(args: IdentityArgs) -> i32 {
    for path in &args.files {
        let payload = match read_payload(path) {
            Ok(payload) => payload,
            Err(code) => return code,
        };
        let identity = ContentIdentity::of(&payload);
        println!("{}  {:>10}  {}", identity, payload.len(), path.display());
    }
    EXIT_SUCCESS
}

fn probe_config(args: &ProbeArgs) -> Result<LoaderConfig, i32> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|err| {
                eprintln!("failed to read config {}: {}", path.display(), err);
                EXIT_IO
            })?;
            LoaderConfig::from_toml_str(&text).map_err(|err| {
                eprintln!("{}", err);
                EXIT_CONFIG
            })?
        }
        None => LoaderConfig::default(),
    };
    if let Some(preview) = args.preview {
        config.preview_max_dimension = preview;
    }
    if let Some(max_images) = args.max_images {
        config.max_cached_images = max_images;
    }
    if let Some(max_bytes) = args.max_bytes {
        config.max_cached_bytes = max_bytes;
    }
    if let Some(quantity) = args.batch_quantity {
        config.batch.quantity_limit = quantity;
    }
    if let Some(ms) = args.batch_ms {
        config.batch.time_limit_ms = ms;
    }
    config.validate().map_err(|err| {
        eprintln!("{}", err);
        EXIT_USAGE
    })?;
    Ok(config)
}

fn run_probe(args: ProbeArgs) -> i32 {
    let config = match probe_config(&args) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let mut payloads = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match read_payload(path) {
            Ok(payload) => payloads.push(payload),
            Err(code) => return code,
        }
    }
    let engine = match LoaderEngine::new(config, Arc::new(PngRenderer)) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_ENGINE;
        }
    };

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    let mut notifications = Vec::with_capacity(payloads.len());
    for (index, payload) in payloads.iter().enumerate() {
        let outcome = engine.enqueue(payload, args.priority.priority());
        let tx = Mutex::new(tx.clone());
        let notification = Notification::batched(
            move |bitmap: Arc<Bitmap>| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send((index, bitmap.dimensions(), started.elapsed()));
                }
            },
            engine.batcher(),
        );
        if let Some(cached) = engine.lookup(payload, Some(&notification)) {
            println!(
                "{}: {} with cached {}x{}",
                args.files[index].display(),
                outcome,
                cached.width(),
                cached.height()
            );
        } else {
            println!("{}: {}", args.files[index].display(), outcome);
        }
        notifications.push(notification);
    }
    drop(tx);

    let timeout = Duration::from_secs(args.timeout_secs);
    if !engine.wait_idle(timeout) {
        eprintln!("engine did not go idle within {:?}", timeout);
        return EXIT_TIMEOUT;
    }
    // Batched deliveries can trail the last stage by up to the batch time limit.
    let quiet = engine.batcher().time_limit() + Duration::from_millis(100);
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(quiet) {
        events.push(event);
    }
    for notification in &notifications {
        notification.cancel();
    }

    for (index, (width, height), elapsed) in events {
        println!(
            "  [{:>8.1} ms] {} -> {}x{}",
            elapsed.as_secs_f64() * 1000.0,
            args.files[index].display(),
            width,
            height
        );
    }
    for (path, payload) in args.files.iter().zip(&payloads) {
        match engine.snapshot(payload) {
            Some(snapshot) => {
                let sizes: Vec<String> = snapshot
                    .resolutions
                    .iter()
                    .map(|(width, height)| format!("{}x{}", width, height))
                    .collect();
                println!(
                    "{}: {} cached [{}] ({} bytes)",
                    path.display(),
                    snapshot.identity,
                    sizes.join(", "),
                    snapshot.estimated_bytes
                );
            }
            None => println!("{}: not cached", path.display()),
        }
    }
    print_telemetry(&engine);
    EXIT_SUCCESS
}

fn run_bench(args: BenchArgs) -> i32 {
    let mut config = LoaderConfig::default();
    if let Some(workers) = args.critical_workers {
        config.critical_concurrency = workers;
    }
    let renderer = Arc::new(
        SyntheticRenderer::new().with_delay(Duration::from_millis(args.delay_ms)),
    );
    let shared: Arc<dyn Renderer> = Arc::clone(&renderer) as Arc<dyn Renderer>;
    let engine = match LoaderEngine::new(config, shared) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_ENGINE;
        }
    };
    let payloads: Vec<Vec<u8>> = (0..args.count as u64)
        .map(|seed| synthetic_payload(args.width, args.height, seed))
        .collect();

    let started = Instant::now();
    for payload in &payloads {
        engine.enqueue(payload, args.priority.priority());
    }
    let enqueued = started.elapsed();
    let timeout = Duration::from_secs(args.timeout_secs);
    if !engine.wait_idle(timeout) {
        eprintln!("engine did not go idle within {:?}", timeout);
        return EXIT_TIMEOUT;
    }
    let finished = started.elapsed();
    let calls = renderer.calls();
    println!(
        "bench: {} payloads {}x{} enqueued in {:.2} ms, idle after {:.2} ms",
        args.count,
        args.width,
        args.height,
        enqueued.as_secs_f64() * 1000.0,
        finished.as_secs_f64() * 1000.0
    );
    println!(
        "renderer calls: {} fast, {} refined, {} final",
        calls.fast_previews, calls.refined_previews, calls.finals
    );
    print_telemetry(&engine);
    EXIT_SUCCESS
}

fn print_telemetry(engine: &LoaderEngine) {
    let telemetry = engine.telemetry();
    println!(
        "cache: {} entries, {} bytes, {} evicted",
        telemetry.entries, telemetry.cached_bytes, telemetry.entries_evicted
    );
    println!(
        "stages: {} executed, {} unheard renders, critical limit {} ({} workers)",
        telemetry.stages_executed,
        telemetry.wasted_renders,
        telemetry.critical_limit,
        telemetry.critical_workers
    );
    if let Some(error) = loader_core::observability::sticky_error() {
        println!("last error: {}", error);
    }
}
