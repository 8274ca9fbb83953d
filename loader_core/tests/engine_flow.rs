use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use loader_core::synthetic::{synthetic_payload, RenderKind, SyntheticRenderer};
use loader_core::{
    Bitmap, BatchConfig, EnqueueOutcome, LoaderConfig, LoaderEngine, Notification, Priority,
    Renderer,
};

const WAIT: Duration = Duration::from_secs(10);

fn threaded(renderer: &Arc<SyntheticRenderer>, config: LoaderConfig) -> LoaderEngine {
    let shared: Arc<dyn Renderer> = Arc::clone(renderer) as Arc<dyn Renderer>;
    LoaderEngine::new(config, shared).expect("engine")
}

fn channel_notification(
    tx: &mpsc::Sender<(usize, (u32, u32), Instant)>,
    tag: usize,
    engine: Option<&LoaderEngine>,
) -> Notification {
    let tx = Mutex::new(tx.clone());
    let sink = move |bitmap: Arc<Bitmap>| {
        let _ = tx
            .lock()
            .expect("sink lock")
            .send((tag, bitmap.dimensions(), Instant::now()));
    };
    match engine {
        Some(engine) => Notification::batched(sink, engine.batcher()),
        None => Notification::new(sink),
    }
}

#[test]
fn renders_arrive_smallest_first() {
    let renderer = Arc::new(SyntheticRenderer::new());
    renderer.pause();
    let engine = threaded(&renderer, LoaderConfig::default());
    let payload = synthetic_payload(1600, 1200, 1);
    assert_eq!(engine.enqueue(&payload, Priority::High), EnqueueOutcome::Created);
    let (tx, rx) = mpsc::channel();
    let notification = channel_notification(&tx, 0, None);
    assert!(engine.lookup(&payload, Some(&notification)).is_none());
    renderer.resume();

    let sizes: Vec<(u32, u32)> = (0..3)
        .map(|_| rx.recv_timeout(WAIT).expect("render").1)
        .collect();
    assert_eq!(sizes, vec![(160, 120), (400, 300), (1600, 1200)]);
    assert!(engine.wait_idle(WAIT));
    assert_eq!(engine.lookup(&payload, None).unwrap().dimensions(), (1600, 1200));
    assert_eq!(engine.telemetry().wasted_renders, 0);
}

#[test]
fn duplicate_payloads_render_once() {
    let renderer = Arc::new(SyntheticRenderer::new());
    renderer.pause();
    let engine = threaded(&renderer, LoaderConfig::default());
    let payload = synthetic_payload(640, 480, 2);
    let copy = payload.clone();
    assert_eq!(engine.enqueue(&payload, Priority::Medium), EnqueueOutcome::Created);
    assert_eq!(engine.enqueue(&copy, Priority::Critical), EnqueueOutcome::Joined);
    assert_eq!(engine.len(), 1);
    renderer.resume();
    assert!(engine.wait_idle(WAIT));
    assert_eq!(renderer.calls().finals, 1);
}

#[test]
fn nine_payloads_under_a_six_image_quota() {
    let renderer = Arc::new(SyntheticRenderer::new());
    let config = LoaderConfig {
        max_cached_images: 6,
        ..LoaderConfig::default()
    };
    let engine = threaded(&renderer, config);
    let payloads: Vec<Vec<u8>> = (0..9).map(|seed| synthetic_payload(800, 600, seed)).collect();
    for payload in &payloads {
        engine.enqueue(payload, Priority::Medium);
    }
    assert!(engine.wait_idle(WAIT));
    assert_eq!(engine.len(), 6);
    for payload in &payloads[..3] {
        assert!(engine.lookup(payload, None).is_none());
    }
    for payload in &payloads[3..] {
        assert!(engine.lookup(payload, None).is_some());
    }
}

#[test]
fn critical_work_preempts_queued_standard_work() {
    let renderer = Arc::new(SyntheticRenderer::new());
    renderer.pause();
    let engine = threaded(&renderer, LoaderConfig::default());
    engine.enqueue(&synthetic_payload(600, 400, 1), Priority::Medium);
    assert!(renderer.wait_for_in_flight(1, WAIT));
    engine.enqueue(&synthetic_payload(500, 300, 2), Priority::Low);
    engine.enqueue(&synthetic_payload(700, 500, 3), Priority::Critical);
    renderer.resume();
    assert!(engine.wait_idle(WAIT));

    let history = renderer.history();
    assert_eq!(history.len(), 9);
    let last_critical = history
        .iter()
        .rposition(|call| call.source == (700, 500))
        .unwrap();
    let first_low = history
        .iter()
        .position(|call| call.source == (500, 300))
        .unwrap();
    let second_medium = history
        .iter()
        .enumerate()
        .filter(|(_, call)| call.source == (600, 400))
        .nth(1)
        .map(|(index, _)| index)
        .unwrap();
    assert!(last_critical < first_low);
    assert!(last_critical < second_medium);
}

#[test]
fn critical_parallelism_follows_the_limit() {
    let renderer = Arc::new(SyntheticRenderer::new());
    renderer.pause();
    let config = LoaderConfig {
        critical_concurrency: 1,
        ..LoaderConfig::default()
    };
    let engine = threaded(&renderer, config);
    for seed in 0..3 {
        engine.enqueue(&synthetic_payload(300, 200, seed), Priority::Critical);
    }
    assert!(renderer.wait_for_in_flight(1, WAIT));
    assert!(!renderer.wait_for_in_flight(2, Duration::from_millis(100)));
    engine.set_critical_concurrency_limit(3).unwrap();
    assert!(renderer.wait_for_in_flight(3, WAIT));
    assert_eq!(engine.telemetry().critical_workers, 3);
    renderer.resume();
    assert!(engine.wait_idle(WAIT));
    assert_eq!(engine.len(), 3);
}

#[test]
fn cancel_during_a_stage_keeps_the_render_and_resumes() {
    let renderer = Arc::new(SyntheticRenderer::new());
    renderer.pause();
    let engine = threaded(&renderer, LoaderConfig::default());
    let payload = synthetic_payload(900, 600, 5);
    engine.enqueue(&payload, Priority::Medium);
    assert!(renderer.wait_for_in_flight(1, WAIT));
    engine.cancel(&payload);
    renderer.resume();
    assert!(engine.wait_idle(WAIT));

    let snapshot = engine.snapshot(&payload).expect("entry kept");
    assert_eq!(snapshot.resolutions, vec![(160, 106)]);
    let task = snapshot.task.expect("task kept for resumption");
    assert!(task.cancelled);
    assert_eq!(task.interest, 0);

    assert_eq!(engine.enqueue(&payload, Priority::Medium), EnqueueOutcome::Resumed);
    assert!(engine.wait_idle(WAIT));
    let kinds: Vec<RenderKind> = renderer.history().iter().map(|call| call.kind).collect();
    assert_eq!(
        kinds,
        vec![RenderKind::FastPreview, RenderKind::RefinedPreview, RenderKind::Final]
    );
    assert_eq!(engine.snapshot(&payload).unwrap().resolutions.len(), 3);
}

#[test]
fn repeated_cancels_never_drive_interest_negative() {
    let renderer = Arc::new(SyntheticRenderer::new());
    let engine = LoaderEngine::new(
        LoaderConfig::manual(),
        Arc::clone(&renderer) as Arc<dyn Renderer>,
    )
    .unwrap();
    let payload = synthetic_payload(900, 600, 6);
    engine.enqueue(&payload, Priority::Low);
    assert!(engine.step());
    for _ in 0..4 {
        engine.cancel(&payload);
    }
    let task = engine.snapshot(&payload).unwrap().task.unwrap();
    assert_eq!(task.interest, 0);
    assert_eq!(engine.enqueue(&payload, Priority::Low), EnqueueOutcome::Resumed);
    assert_eq!(engine.snapshot(&payload).unwrap().task.unwrap().interest, 1);
}

#[test]
fn six_ready_renders_share_one_batch() {
    let renderer = Arc::new(SyntheticRenderer::new().without_previews());
    renderer.pause();
    let config = LoaderConfig {
        batch: BatchConfig {
            quantity_limit: 6,
            time_limit_ms: 60_000,
        },
        ..LoaderConfig::default()
    };
    let engine = threaded(&renderer, config);
    let (tx, rx) = mpsc::channel();
    let mut notifications = Vec::new();
    for seed in 0..6 {
        let payload = synthetic_payload(320, 240, seed);
        engine.enqueue(&payload, Priority::High);
        let notification = channel_notification(&tx, seed as usize, Some(&engine));
        engine.lookup(&payload, Some(&notification));
        notifications.push(notification);
    }
    renderer.resume();
    let mut tags: Vec<usize> = (0..6)
        .map(|_| rx.recv_timeout(WAIT).expect("batched render").0)
        .collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(engine.batcher().batches_delivered(), 1);
}

#[test]
fn lone_render_waits_for_the_time_limit() {
    let renderer = Arc::new(SyntheticRenderer::new().without_previews());
    renderer.pause();
    let config = LoaderConfig {
        batch: BatchConfig {
            quantity_limit: 6,
            time_limit_ms: 150,
        },
        ..LoaderConfig::default()
    };
    let engine = threaded(&renderer, config);
    let (tx, rx) = mpsc::channel();
    let payload = synthetic_payload(320, 240, 42);
    let started = Instant::now();
    engine.enqueue(&payload, Priority::High);
    let notification = channel_notification(&tx, 0, Some(&engine));
    engine.lookup(&payload, Some(&notification));
    renderer.resume();
    let (_, size, delivered_at) = rx.recv_timeout(WAIT).expect("render");
    assert_eq!(size, (320, 240));
    assert!(delivered_at.duration_since(started) >= Duration::from_millis(150));
}

#[test]
fn toml_config_drives_the_engine() {
    let config = LoaderConfig::from_toml_str(
        r#"
mode = "manual"
preview_max_dimension = 100
max_cached_images = 2
"#,
    )
    .unwrap();
    let renderer = Arc::new(SyntheticRenderer::new());
    let engine = threaded(&renderer, config);
    let payload = synthetic_payload(1000, 800, 9);
    engine.enqueue(&payload, Priority::Medium);
    engine.pump();
    let sizes = engine.snapshot(&payload).unwrap().resolutions;
    // The embedded thumbnail already fills the preview size.
    assert_eq!(sizes, vec![(100, 80), (1000, 800)]);
}
