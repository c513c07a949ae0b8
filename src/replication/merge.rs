//! Last-writer-wins merge
//!
//! Commutative and idempotent: for every id the record with the strictly
//! greater `updated_at` survives, ties keep the local value, so duplicated or
//! reordered deliveries converge to the same state.

use super::record::{Collection, Dataset, Record};

/// Merge `incoming` into `local`.
///
/// Returns `None` when no record changed so callers can skip downstream
/// updates, otherwise the merged collection.
pub fn merge_collection(local: &Collection, incoming: &Collection) -> Option<Collection> {
    let mut merged: Option<Collection> = None;
    for record in incoming.iter() {
        if accepts(local.get(&record.id), record) {
            merged
                .get_or_insert_with(|| local.clone())
                .insert(record.clone());
        }
    }
    merged
}

/// Merge `incoming` into `local` in place, returning the ids that changed.
pub fn merge_records_into<'a, I>(local: &mut Collection, incoming: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut changed = Vec::new();
    for record in incoming {
        if accepts(local.get(&record.id), record) {
            changed.push(record.id.clone());
            local.insert(record.clone());
        }
    }
    changed
}

/// Merge every collection of `incoming` into `local`.
///
/// `allow` restricts which collection names are accepted; `None` accepts
/// all. Returns the names of the collections that changed, in order.
pub fn merge_dataset(
    local: &mut Dataset,
    incoming: &Dataset,
    allow: Option<&[String]>,
) -> Vec<String> {
    let mut changed = Vec::new();
    for (name, collection) in incoming.collections() {
        if let Some(allowed) = allow {
            if !allowed.iter().any(|a| a == name) {
                log::debug!("Ignoring unknown collection {}", name);
                continue;
            }
        }
        let current = local.collection(name).cloned().unwrap_or_default();
        if let Some(merged) = merge_collection(&current, collection) {
            local.set_collection(name, merged);
            changed.push(name.to_string());
        }
    }
    changed
}

fn accepts(local: Option<&Record>, incoming: &Record) -> bool {
    match local {
        None => true,
        Some(existing) => incoming.supersedes(existing),
    }
}
