//! Deterministic payloads and a renderer that "decodes" them, for tests and
//! benchmarks that need the engine without a real image codec.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::render::{fit_within, Bitmap, Renderer};
use crate::sync::{lock_unpoisoned, wait_unpoisoned};

const MAGIC: &[u8; 4] = b"SYN1";
const HEADER_LEN: usize = 12;
const FILLER_LEN: usize = 4096;

/// Longest side of the thumbnail returned when embedded previews are allowed.
pub const EMBEDDED_THUMBNAIL_MAX: u32 = 160;

/// Builds a payload that renders at `width` x `height`. Different seeds give
/// different identities for the same size.
pub fn synthetic_payload(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(HEADER_LEN + FILLER_LEN);
    payload.extend_from_slice(MAGIC);
    payload.extend_from_slice(&width.to_le_bytes());
    payload.extend_from_slice(&height.to_le_bytes());
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    for _ in 0..FILLER_LEN {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        payload.push((state >> 24) as u8);
    }
    payload
}

pub fn synthetic_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() < HEADER_LEN || &payload[..4] != MAGIC {
        return None;
    }
    let width = u32::from_le_bytes(payload[4..8].try_into().ok()?);
    let height = u32::from_le_bytes(payload[8..12].try_into().ok()?);
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderKind {
    FastPreview,
    RefinedPreview,
    Final,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderCall {
    pub kind: RenderKind,
    pub source: (u32, u32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderCalls {
    pub fast_previews: usize,
    pub refined_previews: usize,
    pub finals: usize,
}

pub struct SyntheticRenderer {
    previews: bool,
    delay: Duration,
    history: Mutex<Vec<RenderCall>>,
    in_flight: AtomicUsize,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl SyntheticRenderer {
    pub fn new() -> Self {
        Self {
            previews: true,
            delay: Duration::ZERO,
            history: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    /// Every preview request returns nothing, as for formats without a cheap
    /// preview path.
    pub fn without_previews(mut self) -> Self {
        self.previews = false;
        self
    }

    /// Sleeps for `delay` inside every render call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Render calls block until `resume` is called.
    pub fn pause(&self) {
        *lock_unpoisoned(&self.paused) = true;
    }

    pub fn resume(&self) {
        *lock_unpoisoned(&self.paused) = false;
        self.resumed.notify_all();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Polls until at least `count` render calls are in progress.
    pub fn wait_for_in_flight(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() < count {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn history(&self) -> Vec<RenderCall> {
        lock_unpoisoned(&self.history).clone()
    }

    pub fn calls(&self) -> RenderCalls {
        let history = lock_unpoisoned(&self.history);
        let mut calls = RenderCalls::default();
        for call in history.iter() {
            match call.kind {
                RenderKind::FastPreview => calls.fast_previews += 1,
                RenderKind::RefinedPreview => calls.refined_previews += 1,
                RenderKind::Final => calls.finals += 1,
            }
        }
        calls
    }

    fn enter(&self, kind: RenderKind, payload: &[u8]) -> Option<(u32, u32)> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        {
            let mut paused = lock_unpoisoned(&self.paused);
            while *paused {
                paused = wait_unpoisoned(&self.resumed, paused);
            }
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let source = synthetic_dimensions(payload);
        if let Some(source) = source {
            lock_unpoisoned(&self.history).push(RenderCall { kind, source });
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        source
    }

    fn paint(width: u32, height: u32, payload: &[u8]) -> Bitmap {
        let fill = payload.get(HEADER_LEN).copied().unwrap_or(0x80);
        Bitmap::new(width, height, vec![fill; width as usize * height as usize * 4])
    }
}

impl Default for SyntheticRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for SyntheticRenderer {
    fn render_preview(
        &self,
        payload: &[u8],
        max_dimension: u32,
        allow_embedded: bool,
    ) -> Option<Bitmap> {
        let kind = if allow_embedded {
            RenderKind::FastPreview
        } else {
            RenderKind::RefinedPreview
        };
        let (width, height) = self.enter(kind, payload)?;
        if !self.previews {
            return None;
        }
        let limit = if allow_embedded {
            max_dimension.min(EMBEDDED_THUMBNAIL_MAX)
        } else {
            max_dimension
        };
        let (width, height) = fit_within(width, height, limit);
        Some(Self::paint(width, height, payload))
    }

    fn render_final(&self, payload: &[u8]) -> Option<Bitmap> {
        let (width, height) = self.enter(RenderKind::Final, payload)?;
        Some(Self::paint(width, height, payload))
    }
}
