//! The implementation of the `TEMPLAR_LOG` environment variable.
//!
//! `TEMPLAR_LOG=-` logs trace state transitions and template dumps to
//! stderr; any other value is treated as a path to append to. When the
//! variable is unset, logging is a no-op.

use std::{env, fs::File, io::Write, sync::LazyLock};

static LOG_TARGET: LazyLock<Option<String>> = LazyLock::new(|| env::var("TEMPLAR_LOG").ok());

/// Log a tracing-subsystem event.
pub(crate) fn log_trace_state(state: &str) {
    match LOG_TARGET.as_ref().map(|x| x.as_str()) {
        Some("-") => eprintln!("templar: {state}"),
        Some(x) => {
            File::options()
                .append(true)
                .create(true)
                .open(x)
                .and_then(|mut x| writeln!(x, "templar: {state}"))
                .ok();
        }
        None => (),
    }
}

/// Is template dumping enabled at all? Callers use this to avoid building
/// dump strings that would go nowhere.
pub(crate) fn should_log() -> bool {
    LOG_TARGET.is_some()
}
