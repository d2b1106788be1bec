//! Stable, sortable ID generation. Every ID embeds a UTC timestamp so
//! ordering-by-ID and ordering-by-time agree, which the Chunk Engine and
//! Governor both rely on.

use chrono::Utc;
use uuid::Uuid;

fn compact_timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `bb_<UTC>_<hex>`
pub fn block_id() -> String {
    format!("bb_{}_{}", compact_timestamp(), short_hex())
}

/// `turn_<UTC>`
pub fn turn_id() -> String {
    format!("turn_{}", compact_timestamp())
}

/// `<parent>_<level><ordinal>`, zero-padded ordinal.
pub fn chunk_id(parent: &str, level_tag: &str, ordinal: u32) -> String {
    format!("{parent}_{level_tag}{ordinal:02}")
}

pub fn fact_id() -> String {
    format!("fact_{}_{}", compact_timestamp(), short_hex())
}

/// `dos_<UTC>`
pub fn dossier_id() -> String {
    format!("dos_{}", compact_timestamp())
}

pub fn dossier_fact_id() -> String {
    format!("dosfact_{}_{}", compact_timestamp(), short_hex())
}

pub fn provenance_id() -> String {
    format!("prov_{}_{}", compact_timestamp(), short_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_has_expected_prefix() {
        let id = block_id();
        assert!(id.starts_with("bb_"));
    }

    #[test]
    fn chunk_id_is_zero_padded() {
        assert_eq!(chunk_id("turn_x", "p", 3), "turn_x_p03");
    }

    #[test]
    fn ids_are_unique_across_calls() {
        assert_ne!(fact_id(), fact_id());
        assert_ne!(dossier_id(), dossier_id());
    }
}
