//! Native uncaught-fault hook for in-process hosts.
//!
//! Rust code can report its own faults directly, so this is the preferred
//! detection path; output scanning is only a fallback for hosts that print
//! their fatal diagnostics. A process-wide panic hook records the location and
//! a backtrace of panics raised inside a [`catch`] scope. Panics elsewhere go
//! to whatever hook was installed before.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use super::classification::{CanonicalError, Location};
use super::normalizer::ExceptionNormalizer;

static INSTALL: Once = Once::new();

struct PanicRecord {
    location: Option<Location>,
    backtrace: String,
}

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicRecord>> = const { RefCell::new(None) };
}

/// Installs the capturing panic hook. Repeat calls are no-ops.
pub fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let guarded = GUARD_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false);
            if !guarded {
                previous(info);
                return;
            }
            let record = PanicRecord {
                location: info
                    .location()
                    .map(|l| Location::new(l.file(), l.line())),
                backtrace: Backtrace::force_capture().to_string(),
            };
            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(record));
        }));
    });
}

/// Returns true once the capturing hook is in place.
pub fn is_hook_installed() -> bool {
    INSTALL.is_completed()
}

/// Runs `f`, converting a panic into a fatal [`CanonicalError`].
pub fn catch<T>(f: impl FnOnce() -> T) -> Result<T, CanonicalError> {
    install_hook();

    GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARD_DEPTH.with(|depth| depth.set(depth.get() - 1));

    result.map_err(|payload| {
        let record = LAST_PANIC.with(|slot| slot.borrow_mut().take());
        let (location, backtrace) = match record {
            Some(record) => (record.location, Some(record.backtrace)),
            None => (None, None),
        };
        ExceptionNormalizer::from_panic(payload.as_ref(), location, backtrace.as_deref())
    })
}
