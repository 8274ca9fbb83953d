#![forbid(unsafe_code)]

pub mod batch;
mod cache;
pub mod config;
pub mod content_id;
pub mod engine;
mod eviction;
pub mod logging;
pub mod notify;
pub mod observability;
pub mod render;
pub mod scheduler;
mod sync;
pub mod synthetic;
pub mod task;

pub use batch::NotificationBatcher;
pub use config::{BatchConfig, ExecutionMode, LoaderConfig, LoaderError};
pub use content_id::ContentIdentity;
pub use engine::{EnqueueOutcome, EntrySnapshot, LoaderEngine, LoaderTelemetry, TaskSnapshot};
pub use notify::{Notification, RenderSink};
pub use render::{fit_within, Bitmap, Lane, Priority, RenderStage, Renderer};
pub use scheduler::QueueTelemetry;
