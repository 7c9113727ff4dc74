//! Per-session marker appended to runtime-rendered diagnostics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque token that tells genuine runtime diagnostics apart from page text
/// that happens to look like one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionMarker(String);

impl SessionMarker {
    /// Generates a fresh marker. No two calls in a process return the same value.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let stack_probe = 0u8;

        let mut hasher = Sha256::new();
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        hasher.update((&stack_probe as *const u8 as usize).to_le_bytes());
        let digest = hasher.finalize();

        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bracketed form the host appends to its diagnostics.
    pub fn suffix(&self) -> String {
        format!("[{}]", self.0)
    }
}

impl fmt::Display for SessionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
