//! # In-Memory Remote
//!
//! A [`RemoteBackend`] kept entirely in memory. It behaves like the real
//! authority for the engine's purposes: it assigns ids and versions, keeps
//! tombstones, enforces references between tables, and can be taken offline
//! or told to fail upcoming calls. Used by the simulator binary and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use ironlog_core::{reference, EntityTable, Payload, RemoteRecord};
use ironlog_db::now_millis;

use crate::remote::{CreatedRecord, RemoteBackend, RemoteError, RemoteResult};

/// One call received by the remote, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List { table: EntityTable, cursor: i64 },
    Create { table: EntityTable },
    Update { table: EntityTable, remote_id: String },
    Delete { table: EntityTable, remote_id: String },
}

impl RemoteCall {
    /// Returns true for create/update/delete.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RemoteCall::List { .. })
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    owner: String,
    payload: Payload,
    updated_at: i64,
    deleted: bool,
}

#[derive(Debug)]
struct RemoteState {
    clock: i64,
    next_id: u64,
    tables: HashMap<EntityTable, BTreeMap<String, StoredRecord>>,
    reachable: bool,
    faults: VecDeque<RemoteError>,
    latency: Option<Duration>,
    calls: Vec<RemoteCall>,
}

impl RemoteState {
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn table(&mut self, table: EntityTable) -> &mut BTreeMap<String, StoredRecord> {
        self.tables.entry(table).or_default()
    }

    fn is_live(&self, table: EntityTable, remote_id: &str) -> bool {
        self.tables
            .get(&table)
            .and_then(|records| records.get(remote_id))
            .is_some_and(|r| !r.deleted)
    }

    /// Rejects payloads referencing parents the remote does not hold.
    fn check_references(&self, table: EntityTable, payload: &Payload) -> RemoteResult<()> {
        for key in table.foreign_keys() {
            let parent = reference(payload, key.field)
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            match parent {
                Some(id) if !self.is_live(key.parent, &id) => {
                    return Err(RemoteError::Rejected(format!(
                        "{} references unknown {} {}",
                        key.field, key.parent, id
                    )));
                }
                None if key.required => {
                    return Err(RemoteError::Rejected(format!("{} is required", key.field)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Consumes the next injected fault, or fails if offline.
    fn gate(&mut self, call: RemoteCall) -> RemoteResult<()> {
        if !self.reachable {
            return Err(RemoteError::Network("remote unreachable".into()));
        }
        self.calls.push(call);
        match self.faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// In-memory remote authority.
#[derive(Debug)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        InMemoryRemote {
            state: Mutex::new(RemoteState {
                clock: 0,
                next_id: 1,
                tables: HashMap::new(),
                reachable: true,
                faults: VecDeque::new(),
                latency: None,
                calls: Vec::new(),
            }),
        }
    }

    /// Takes the remote offline (every call fails with a network error) or
    /// brings it back.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Makes the next received call fail with `error`. Faults queue up.
    pub async fn fail_next(&self, error: RemoteError) {
        self.state.lock().await.faults.push_back(error);
    }

    /// Delays every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Calls received so far (calls made while offline are not recorded).
    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of create/update/delete calls received so far.
    pub async fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.is_mutation())
            .count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Live (non-deleted) records of a table as `(remote_id, payload)`.
    pub async fn live_records(&self, table: EntityTable) -> Vec<(String, Payload)> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&table)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, r)| !r.deleted)
                    .map(|(id, r)| (id.clone(), r.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fetches one record, tombstones included.
    pub async fn get(&self, table: EntityTable, remote_id: &str) -> Option<RemoteRecord> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&table)
            .and_then(|records| records.get(remote_id))
            .map(|r| RemoteRecord {
                remote_id: remote_id.to_string(),
                updated_at: r.updated_at,
                payload: r.payload.clone(),
                deleted: r.deleted,
            })
    }

    /// Writes a record as another device would, with an explicit version.
    ///
    /// Bypasses reachability, faults, and the call log.
    pub async fn put_external(
        &self,
        table: EntityTable,
        owner: &str,
        remote_id: &str,
        payload: Payload,
        updated_at: i64,
    ) {
        let mut state = self.state.lock().await;
        state.clock = state.clock.max(updated_at);
        state.table(table).insert(
            remote_id.to_string(),
            StoredRecord {
                owner: owner.to_string(),
                payload,
                updated_at,
                deleted: false,
            },
        );
    }

    /// Deletes a record as another device would, leaving a tombstone.
    ///
    /// Returns false if the record is unknown.
    pub async fn delete_external(&self, table: EntityTable, remote_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let updated_at = state.tick();
        match state.table(table).get_mut(remote_id) {
            Some(record) => {
                record.deleted = true;
                record.payload.clear();
                record.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    /// Drops a record without leaving a tombstone (as after tombstone
    /// compaction).
    pub async fn purge_external(&self, table: EntityTable, remote_id: &str) -> bool {
        self.state.lock().await.table(table).remove(remote_id).is_some()
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteBackend for InMemoryRemote {
    async fn list_changed_since(
        &self,
        table: EntityTable,
        owner: &str,
        cursor: i64,
    ) -> RemoteResult<Vec<RemoteRecord>> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.gate(RemoteCall::List { table, cursor })?;

        let mut records: Vec<RemoteRecord> = state
            .tables
            .get(&table)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, r)| r.owner == owner && r.updated_at > cursor)
                    .map(|(id, r)| RemoteRecord {
                        remote_id: id.clone(),
                        updated_at: r.updated_at,
                        payload: r.payload.clone(),
                        deleted: r.deleted,
                    })
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.updated_at);

        debug!(%table, cursor, count = records.len(), "Remote listed changes");
        Ok(records)
    }

    async fn create_record(
        &self,
        table: EntityTable,
        owner: &str,
        payload: &Payload,
    ) -> RemoteResult<CreatedRecord> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.gate(RemoteCall::Create { table })?;
        state.check_references(table, payload)?;

        let remote_id = format!("r-{}", state.next_id);
        state.next_id += 1;
        let updated_at = state.tick();
        state.table(table).insert(
            remote_id.clone(),
            StoredRecord {
                owner: owner.to_string(),
                payload: payload.clone(),
                updated_at,
                deleted: false,
            },
        );

        debug!(%table, remote_id = %remote_id, "Remote created record");
        Ok(CreatedRecord {
            remote_id,
            updated_at,
        })
    }

    async fn update_record(
        &self,
        table: EntityTable,
        remote_id: &str,
        payload: &Payload,
    ) -> RemoteResult<i64> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.gate(RemoteCall::Update {
            table,
            remote_id: remote_id.to_string(),
        })?;
        if !state.is_live(table, remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        state.check_references(table, payload)?;

        let updated_at = state.tick();
        let record = state
            .table(table)
            .get_mut(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        for (field, value) in payload {
            record.payload.insert(field.clone(), value.clone());
        }
        record.updated_at = updated_at;

        Ok(updated_at)
    }

    async fn delete_record(&self, table: EntityTable, remote_id: &str) -> RemoteResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock().await;
        state.gate(RemoteCall::Delete {
            table,
            remote_id: remote_id.to_string(),
        })?;
        if !state.is_live(table, remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }

        let updated_at = state.tick();
        if let Some(record) = state.table(table).get_mut(remote_id) {
            record.deleted = true;
            record.payload.clear();
            record.updated_at = updated_at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_versions() {
        let remote = InMemoryRemote::new();
        let a = remote
            .create_record(EntityTable::Schema, "u1", &payload(json!({ "name": "A" })))
            .await
            .unwrap();
        let b = remote
            .create_record(EntityTable::Schema, "u1", &payload(json!({ "name": "B" })))
            .await
            .unwrap();

        assert_ne!(a.remote_id, b.remote_id);
        assert!(b.updated_at > a.updated_at);
        assert_eq!(remote.mutation_count().await, 2);
    }

    #[tokio::test]
    async fn test_child_requires_known_parent() {
        let remote = InMemoryRemote::new();
        let err = remote
            .create_record(EntityTable::Day, "u1", &payload(json!({ "schemaId": "r-404" })))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));

        let err = remote
            .create_record(EntityTable::Day, "u1", &payload(json!({ "name": "Legs" })))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_listing_is_owner_scoped_and_includes_tombstones() {
        let remote = InMemoryRemote::new();
        let mine = remote
            .create_record(EntityTable::Schema, "u1", &payload(json!({})))
            .await
            .unwrap();
        remote
            .create_record(EntityTable::Schema, "u2", &payload(json!({})))
            .await
            .unwrap();
        remote.delete_record(EntityTable::Schema, &mine.remote_id).await.unwrap();

        let listed = remote.list_changed_since(EntityTable::Schema, "u1", 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].deleted);

        let err = remote.delete_record(EntityTable::Schema, &mine.remote_id).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_offline_and_injected_faults() {
        let remote = InMemoryRemote::new();
        remote.set_reachable(false).await;
        let err = remote.list_changed_since(EntityTable::Day, "u1", 0).await.unwrap_err();
        assert!(err.is_transient());
        assert!(remote.calls().await.is_empty());

        remote.set_reachable(true).await;
        remote.fail_next(RemoteError::Unauthorized("expired".into())).await;
        let err = remote.list_changed_since(EntityTable::Day, "u1", 0).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized(_)));
        assert!(remote.list_changed_since(EntityTable::Day, "u1", 0).await.is_ok());
    }
}
