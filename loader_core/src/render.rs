use std::fmt;
use std::sync::Arc;

/// Gap between the undecayed priorities of neighbouring tiers. Must exceed the
/// largest stage ordinal so decayed priorities never reach the next tier.
pub const PRIORITY_SPREAD: u32 = 3;

const ROW_ALIGN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Prospective,
}

impl Priority {
    pub fn value(self) -> u32 {
        match self {
            Priority::Critical => 1,
            Priority::High => 5,
            Priority::Medium => 10,
            Priority::Low => 20,
            Priority::Prospective => 100,
        }
    }

    /// Effective priority of a task of this tier before it has rendered anything.
    pub fn floor(self) -> u32 {
        (self.value() - 1) * PRIORITY_SPREAD + 1
    }

    pub fn is_more_urgent_than(self, other: Priority) -> bool {
        self.value() < other.value()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Prospective => "prospective",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            "prospective" => Some(Priority::Prospective),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution lane a queued priority value belongs to.
///
/// Every value below the first `High` priority can only come from a task whose
/// base priority is `Critical`, so the lane follows the base tier even after
/// the task's priority has decayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    Critical,
    Standard,
}

impl Lane {
    pub fn for_priority(value: u32) -> Self {
        if value < Priority::High.floor() {
            Lane::Critical
        } else {
            Lane::Standard
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Lane::Critical => "critical",
            Lane::Standard => "standard",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RenderStage {
    FastPreview,
    RefinedPreview,
    Final,
    Done,
}

impl RenderStage {
    pub fn ordinal(self) -> u32 {
        match self {
            RenderStage::FastPreview => 0,
            RenderStage::RefinedPreview => 1,
            RenderStage::Final => 2,
            RenderStage::Done => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RenderStage::FastPreview => "fast_preview",
            RenderStage::RefinedPreview => "refined_preview",
            RenderStage::Final => "final",
            RenderStage::Done => "done",
        }
    }
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn effective_priority(base: Priority, stage: RenderStage, has_rendered: bool) -> u32 {
    let decay = if has_rendered { stage.ordinal() } else { 0 };
    base.floor() + decay
}

/// Immutable RGBA render shared between the cache and notification delivery.
#[derive(Clone, Debug)]
pub struct Bitmap {
    width: u32,
    height: u32,
    rgba: Arc<Vec<u8>>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba: Arc::new(rgba),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    pub fn estimated_bytes(&self) -> usize {
        estimate_bytes(self.width, self.height)
    }
}

/// Pessimistic memory estimate for a render of the given size: rows are
/// rounded up to a 64-byte stride, so the estimate never undercounts a tightly
/// packed RGBA buffer.
pub fn estimate_bytes(width: u32, height: u32) -> usize {
    let row = (width as usize * 4).div_ceil(ROW_ALIGN) * ROW_ALIGN;
    row.saturating_mul(height as usize)
}

/// Scales `width` x `height` down so the longest side fits `max`, keeping the
/// aspect ratio. Sizes that already fit are returned unchanged.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width.max(height) <= max {
        return (width, height);
    }
    if width >= height {
        let scaled = (u64::from(height) * u64::from(max) / u64::from(width)) as u32;
        (max, scaled.max(1))
    } else {
        let scaled = (u64::from(width) * u64::from(max) / u64::from(height)) as u32;
        (scaled.max(1), max)
    }
}

/// Decoding capability the engine drives. Called from worker threads, possibly
/// concurrently for different payloads.
pub trait Renderer: Send + Sync {
    /// Render a preview whose longest side is at most `max_dimension`.
    /// `allow_embedded` permits returning a cheap embedded thumbnail; when it
    /// is false the renderer must produce a fresh downscale.
    fn render_preview(&self, payload: &[u8], max_dimension: u32, allow_embedded: bool)
        -> Option<Bitmap>;

    /// Render the payload at its native resolution.
    fn render_final(&self, payload: &[u8]) -> Option<Bitmap>;
}
