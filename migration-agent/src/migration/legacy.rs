//! §4.1.a: the legacy-config patch carried for old destinations.
//!
//! Partitions the `drives` list by device name (`cdrom`/`floppy` become
//! top-level path fields instead of drive entries) and always adds the
//! empty `afterMigrationStatus` field destinations older than 4.13 still
//! expect to find. This is a behavioral contract, not an artifact — see
//! Design Notes §9 "Legacy compatibility".

use serde_json::{Map, Value};

const LEGACY_DEVICE_FIELDS: [&str; 2] = ["cdrom", "floppy"];

/// Applies the patch in place to a machine-params map (phase 2 of the
/// driver). Runs even when `drives` is absent — `afterMigrationStatus` is
/// still added in that case.
pub fn apply_legacy_patch(params: &mut Map<String, Value>) {
    if let Some(Value::Array(drives)) = params.remove("drives") {
        let mut kept = Vec::with_capacity(drives.len());
        for drive in drives {
            let device = drive.get("device").and_then(Value::as_str);
            match device {
                Some(d) if LEGACY_DEVICE_FIELDS.contains(&d) => {
                    if let Some(path) = drive.get("path").cloned() {
                        params.insert(d.to_string(), path);
                    }
                }
                _ => kept.push(drive),
            }
        }
        params.insert("drives".to_string(), Value::Array(kept));
    }

    params.insert(
        "afterMigrationStatus".to_string(),
        Value::String(String::new()),
    );
}
