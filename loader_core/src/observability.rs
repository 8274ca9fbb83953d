use std::panic::{self, PanicHookInfo};
use std::sync::{Mutex, OnceLock};

use crate::sync::lock_unpoisoned;

fn sticky_cell() -> &'static Mutex<Option<String>> {
    static STICKY: OnceLock<Mutex<Option<String>>> = OnceLock::new();
    STICKY.get_or_init(|| Mutex::new(None))
}

pub fn set_sticky_error(message: impl Into<String>) {
    let message = message.into();
    log::error!("{}", message);
    let mut guard = lock_unpoisoned(sticky_cell());
    *guard = Some(message);
}

pub fn clear_sticky_error() {
    let mut guard = lock_unpoisoned(sticky_cell());
    *guard = None;
}

pub fn sticky_error() -> Option<String> {
    let guard = lock_unpoisoned(sticky_cell());
    guard.clone()
}

/// Reports a broken engine invariant. Debug builds panic; release builds log,
/// record a sticky error and let the caller drop the offending state.
#[track_caller]
pub fn invariant_violation(message: impl AsRef<str>) {
    let message = format!("invariant violated: {}", message.as_ref());
    if cfg!(debug_assertions) {
        panic!("{}", message);
    }
    set_sticky_error(message);
}

pub fn install_panic_hook() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.set(()).is_err() {
        return;
    }
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        set_sticky_error(format_panic(info));
        default_hook(info);
    }));
}

pub(crate) fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn format_panic(info: &PanicHookInfo<'_>) -> String {
    let payload = panic_payload_to_string(info.payload());
    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
    format!("panic at {}: {}", location, payload)
}
