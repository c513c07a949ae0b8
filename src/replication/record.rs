//! Replicated data model
//!
//! A [`Dataset`] is a set of named [`Collection`]s; a collection maps record
//! ids to [`Record`]s. The serde shape of a dataset is exactly the wire
//! payload: `{ "<collection>": [ record, ... ] }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_false(value: &bool) -> bool {
    !*value
}

/// One replicated record.
///
/// `updated_at` is the only conflict-resolution signal. Deletion is a
/// tombstone (`is_deleted`), never physical removal, so it replicates like
/// any other change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_deleted: bool,
    /// Application fields, carried opaquely.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: 0,
            is_deleted: false,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// A tombstoned copy of this record stamped at `updated_at`.
    pub fn tombstone(&self, updated_at: i64) -> Self {
        let mut dead = self.clone();
        dead.is_deleted = true;
        dead.updated_at = updated_at;
        dead
    }

    /// Whether `self` should replace `local` under last-writer-wins.
    /// Equal timestamps keep the local value.
    pub fn supersedes(&self, local: &Record) -> bool {
        self.updated_at > local.updated_at
    }
}

/// Records of one collection keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Record>", into = "Vec<Record>")]
pub struct Collection {
    records: BTreeMap<String, Record>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Insert unconditionally. Replication paths go through
    /// [`merge_collection`](super::merge::merge_collection) instead.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Records that are not tombstoned.
    pub fn live(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| !r.is_deleted)
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    /// Largest `updated_at` in the collection.
    pub fn newest_timestamp(&self) -> Option<i64> {
        self.records.values().map(|r| r.updated_at).max()
    }
}

impl From<Vec<Record>> for Collection {
    fn from(records: Vec<Record>) -> Self {
        let mut collection = Collection::new();
        for record in records {
            // Within one payload a duplicated id resolves like any other
            // conflict.
            match collection.records.get(&record.id) {
                Some(existing) if !record.supersedes(existing) => {}
                _ => {
                    collection.insert(record);
                }
            }
        }
        collection
    }
}

impl From<Collection> for Vec<Record> {
    fn from(collection: Collection) -> Self {
        collection.records.into_values().collect()
    }
}

impl FromIterator<Record> for Collection {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Collection::from(iter.into_iter().collect::<Vec<_>>())
    }
}

/// The whole replicated database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    collections: BTreeMap<String, Collection>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_string()).or_default()
    }

    pub fn set_collection(&mut self, name: &str, collection: Collection) {
        self.collections.insert(name.to_string(), collection);
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn collections(&self) -> impl Iterator<Item = (&str, &Collection)> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&Record> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }

    pub fn insert_record(&mut self, collection: &str, record: Record) {
        self.collection_mut(collection).insert(record);
    }

    pub fn record_count(&self) -> usize {
        self.collections.values().map(Collection::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.values().all(Collection::is_empty)
    }

    /// A dataset holding only the listed `(collection, id)` records.
    pub fn subset<'a, I>(&self, keys: I) -> Dataset
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut subset = Dataset::new();
        for (collection, id) in keys {
            if let Some(record) = self.get(collection, id) {
                subset.insert_record(collection, record.clone());
            }
        }
        subset
    }
}
