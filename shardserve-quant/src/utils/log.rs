use std::{
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use tracing::{info, warn};

#[derive(Hash, PartialEq, Eq, Clone, Copy)]
enum Level {
    Info,
    Warn,
}

static SEEN: Lazy<Mutex<HashSet<(Level, u64)>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Returns `true` the first time `msg` is seen at `level`.
fn first_sighting(level: Level, msg: &str) -> bool {
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    let key = (level, hasher.finish());
    SEEN.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(key)
}

/// Emit an `info!` event once per distinct message for the process lifetime.
pub fn once_log_info<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    if first_sighting(Level::Info, msg) {
        info!("{msg}");
    }
}

/// Emit a `warn!` event once per distinct message for the process lifetime.
pub fn once_log_warn<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    if first_sighting(Level::Warn, msg) {
        warn!("{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_messages_are_suppressed() {
        assert!(first_sighting(Level::Warn, "g_idx rebased for rank 1"));
        assert!(!first_sighting(Level::Warn, "g_idx rebased for rank 1"));
        // Levels are tracked independently.
        assert!(first_sighting(Level::Info, "g_idx rebased for rank 1"));
    }
}
