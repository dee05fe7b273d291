use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

const ID_SEPARATOR: u8 = 0x1f;
const STABLE_ID_HEX_LEN: usize = 32;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    let fallback = OffsetDateTime::from_unix_timestamp(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let value =
        OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000).unwrap_or(fallback);
    value
        .format(&Rfc3339)
        .unwrap_or("1970-01-01T00:00:00Z".to_string())
}

/// SHA-256 hex over the parts, separated by a unit separator byte so that
/// `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update([ID_SEPARATOR]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Deterministic identifier for a domain fact: the same parts always yield the same id.
pub fn stable_id(prefix: &str, parts: &[&str]) -> String {
    let digest = digest_parts(parts);
    format!("{prefix}_{}", &digest[..STABLE_ID_HEX_LEN])
}
