use resilience_core::{RemoteError, StoredRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::UNIQUE_VIOLATION_CODE;

/// Field whose value must be unique among one owner's records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub collection: String,
    pub field: String,
}

impl UniqueConstraint {
    pub fn new(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
        }
    }
}

/// One collection's rows with server-side id and timestamp assignment.
///
/// Timestamps are strictly increasing: a write in the same millisecond as
/// the previous one is stamped one millisecond later, so `updated_at_ms`
/// always changes on update and creation order is total.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordTable {
    records: Vec<StoredRecord>,
    #[serde(default)]
    last_stamp_ms: u64,
}

impl RecordTable {
    pub fn get(&self, id: &str) -> Option<&StoredRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or replace a record verbatim.
    pub fn put(&mut self, record: StoredRecord) {
        self.last_stamp_ms = self
            .last_stamp_ms
            .max(record.created_at_ms)
            .max(record.updated_at_ms);
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn insert(
        &mut self,
        owner_id: &str,
        fields: Value,
        now_ms: u64,
        constraints: &[UniqueConstraint],
    ) -> Result<StoredRecord, RemoteError> {
        let fields = require_object(fields)?;
        self.check_unique(owner_id, None, &fields, constraints)?;

        let stamp = self.next_stamp(now_ms);
        let record = StoredRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_owned(),
            created_at_ms: stamp,
            updated_at_ms: stamp,
            fields: Value::Object(fields),
        };
        self.records.push(record.clone());
        Ok(record)
    }

    pub fn update_if_unmodified(
        &mut self,
        owner_id: &str,
        id: &str,
        expected_updated_at_ms: u64,
        patch: Value,
        now_ms: u64,
        constraints: &[UniqueConstraint],
    ) -> Result<StoredRecord, RemoteError> {
        let patch = require_object(patch)?;
        let idx = self.owned_index(owner_id, id)?;

        if self.records[idx].updated_at_ms != expected_updated_at_ms {
            return Err(RemoteError::PreconditionFailed {
                id: id.to_owned(),
                expected_updated_at_ms,
            });
        }

        let mut merged = match &self.records[idx].fields {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        for (key, value) in patch {
            merged.insert(key, value);
        }
        self.check_unique(owner_id, Some(id), &merged, constraints)?;

        let stamp = self.next_stamp(now_ms);
        let record = &mut self.records[idx];
        record.fields = Value::Object(merged);
        record.updated_at_ms = stamp;
        Ok(record.clone())
    }

    pub fn delete(&mut self, owner_id: &str, id: &str) -> Result<(), RemoteError> {
        let idx = self.owned_index(owner_id, id)?;
        self.records.remove(idx);
        Ok(())
    }

    /// Records owned by `owner_id`, newest created first.
    pub fn list(&self, owner_id: &str) -> Vec<StoredRecord> {
        let mut owned: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        owned
    }

    fn owned_index(&self, owner_id: &str, id: &str) -> Result<usize, RemoteError> {
        self.records
            .iter()
            .position(|r| r.id == id && r.owner_id == owner_id)
            .ok_or_else(|| RemoteError::not_found(id))
    }

    fn next_stamp(&mut self, now_ms: u64) -> u64 {
        let stamp = now_ms.max(self.last_stamp_ms.saturating_add(1));
        self.last_stamp_ms = stamp;
        stamp
    }

    fn check_unique(
        &self,
        owner_id: &str,
        exclude_id: Option<&str>,
        fields: &Map<String, Value>,
        constraints: &[UniqueConstraint],
    ) -> Result<(), RemoteError> {
        for constraint in constraints {
            let Some(value) = fields.get(&constraint.field).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = self.records.iter().any(|r| {
                r.owner_id == owner_id
                    && Some(r.id.as_str()) != exclude_id
                    && r.fields.get(&constraint.field) == Some(value)
            });
            if clash {
                return Err(RemoteError::status(
                    409,
                    Some(UNIQUE_VIOLATION_CODE),
                    format!(
                        "duplicate key value violates unique constraint on {}.{}",
                        constraint.collection, constraint.field
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn require_object(value: Value) -> Result<Map<String, Value>, RemoteError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RemoteError::status(
            400,
            None,
            format!("expected a JSON object, got {other}"),
        )),
    }
}
