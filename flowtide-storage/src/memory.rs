//! In-memory storage engine.
//!
//! Backs tests and the command-line front end. Documents live in ordered
//! maps so reads come back sorted by id.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use crate::collection::Collection;
use crate::error::StorageError;
use crate::filter::Filter;
use crate::{Storage, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// Every document of a collection, ordered by id.
    pub fn dump(&self, collection: Collection) -> Vec<Value> {
        self.collections
            .read()
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn document_id(document: &Value) -> Result<String, StorageError> {
    let object = document
        .as_object()
        .ok_or(StorageError::NotAnObject(json_kind(document)))?;
    object
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(StorageError::MissingId)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        let collections = self.collections.read();
        Ok(collections
            .get(&collection)
            .map(|docs| docs.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Value>, StorageError> {
        let collections = self.collections.read();
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.values().find(|d| filter.matches(d)).cloned()))
    }

    async fn upsert(&self, collection: Collection, document: Value) -> Result<UpsertOutcome, StorageError> {
        let id = document_id(&document)?;
        let mut collections = self.collections.write();
        let docs = collections.entry(collection).or_default();
        let outcome = match docs.insert(id.clone(), document) {
            None => UpsertOutcome::Inserted,
            Some(previous) if Some(&previous) == docs.get(&id) => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        trace!(%collection, %id, ?outcome, "Document upserted");
        Ok(outcome)
    }

    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        changes: Value,
    ) -> Result<usize, StorageError> {
        let changes = match changes {
            Value::Object(changes) => changes,
            other => return Err(StorageError::NotAnObject(json_kind(&other))),
        };
        let mut collections = self.collections.write();
        let Some(docs) = collections.get_mut(&collection) else {
            return Ok(0);
        };
        let mut modified = 0;
        for document in docs.values_mut().filter(|d| filter.matches(d)) {
            if let Value::Object(fields) = document {
                for (key, value) in &changes {
                    fields.insert(key.clone(), value.clone());
                }
                modified += 1;
            }
        }
        Ok(modified)
    }
}
