//! Bounded serialization of check results.
//!
//! `last_check_result_json` has a hard byte budget. Payloads that exceed it
//! are summarized in stages rather than rejected: first the snapshot drops
//! to counts and each `found` list to a short preview, then the snapshot
//! becomes a single note and `found` lists empty out. Overflow is a storage
//! concern, never an error.

use serde_json::{json, Value};

use crate::config::constants::MISSING_FOUND_PREVIEW;
use crate::validation::{CheckOutcome, Snapshot, SnapshotList};

/// Serializes `outcome` into at most `max_bytes` bytes of JSON, summarizing
/// progressively as needed. The minimal form is returned even if it somehow
/// exceeds the budget; its size is bounded by configuration, not by DNS.
pub fn build_result_payload(outcome: &CheckOutcome, max_bytes: usize) -> String {
    let full = serde_json::to_string(outcome).unwrap_or_else(|_| minimal(outcome).to_string());
    if full.len() <= max_bytes {
        return full;
    }

    let summarized = summarized(outcome).to_string();
    if summarized.len() <= max_bytes {
        return summarized;
    }

    minimal(outcome).to_string()
}

/// Stage two: counts-only snapshot, previewed `found` lists.
fn summarized(outcome: &CheckOutcome) -> Value {
    json!({
        "ok": outcome.ok,
        "missing": outcome
            .missing
            .iter()
            .map(|entry| {
                let mut value = serde_json::to_value(entry).unwrap_or_else(|_| json!({}));
                trim_list(&mut value, "found", MISSING_FOUND_PREVIEW);
                trim_list(&mut value, "found_ips", MISSING_FOUND_PREVIEW);
                value
            })
            .collect::<Vec<_>>(),
        "snapshot": counts_only(&outcome.snapshot),
    })
}

/// Stage three: note-only snapshot, empty `found` lists.
fn minimal(outcome: &CheckOutcome) -> Value {
    json!({
        "ok": outcome.ok,
        "missing": outcome
            .missing
            .iter()
            .map(|entry| {
                let mut value = serde_json::to_value(entry).unwrap_or_else(|_| json!({}));
                trim_list(&mut value, "found", 0);
                trim_list(&mut value, "found_ips", 0);
                value
            })
            .collect::<Vec<_>>(),
        "snapshot": { "note": "snapshot omitted: result exceeded storage budget" },
    })
}

fn counts_only(snapshot: &Snapshot) -> Value {
    fn counts(list: &SnapshotList) -> Value {
        json!({ "total": list.total, "truncated": list.truncated })
    }
    json!({
        "cname_apex": counts(&snapshot.cname_apex),
        "cname_dkim": counts(&snapshot.cname_dkim),
        "mx": counts(&snapshot.mx),
        "txt_apex": counts(&snapshot.txt_apex),
        "txt_dmarc": counts(&snapshot.txt_dmarc),
    })
}

fn trim_list(entry: &mut Value, field: &str, keep: usize) {
    if let Some(Value::Array(items)) = entry.get_mut(field) {
        items.truncate(keep);
    }
}
