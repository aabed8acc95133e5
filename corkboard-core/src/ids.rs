/// Temporary identifiers for optimistically created entities.
///
/// The authoritative store assigns real ids. Until a create is confirmed the
/// entity carries a `tmp-xxxxxxxx` id, unique within the process, which is
/// replaced in place once the server responds.
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

pub const TEMP_ID_PREFIX: &str = "tmp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint a new temporary id.
/// Atomic counter plus nanosecond timestamp, hashed for uniform distribution.
pub fn temp_id() -> String {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(ts.to_le_bytes());
    let hash = hasher.finalize();
    format!("{}{}", TEMP_ID_PREFIX, hex::encode(&hash[..4]))
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}
