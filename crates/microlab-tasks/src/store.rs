//! Durable task store backed by redb.
//!
//! One `TASKS` table maps the 16 raw bytes of the task id to the
//! JSON-encoded [`TaskRecord`]. Every mutation runs inside a single write
//! transaction, so a record is either fully updated or left as it was.

use std::path::Path;

use chrono::Utc;
use microlab_core::{LabError, LabResult};
use redb::{Database, ReadableTable, TableDefinition};

use crate::task::{TaskId, TaskRecord, TaskState};

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: task uuid bytes. Value: JSON-encoded TaskRecord.
const TASKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tasks");

fn storage(err: impl std::fmt::Display) -> LabError {
    LabError::Storage(err.to_string())
}

fn decode(bytes: &[u8]) -> LabResult<TaskRecord> {
    serde_json::from_slice(bytes).map_err(storage)
}

// ---------------------------------------------------------------------------
// TaskDb
// ---------------------------------------------------------------------------

pub struct TaskDb {
    db: Database,
}

impl TaskDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> LabResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage)?;
        Self::with_database(db)
    }

    /// Volatile store, used when no database path is configured.
    pub fn in_memory() -> LabResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(storage)?;
        Self::with_database(db)
    }

    fn with_database(db: Database) -> LabResult<Self> {
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(storage)?;
        wt.open_table(TASKS).map_err(storage)?;
        wt.commit().map_err(storage)?;
        Ok(Self { db })
    }

    /// Insert a new record. Returns once the write is committed.
    pub fn insert(&self, record: &TaskRecord) -> LabResult<()> {
        let value = serde_json::to_vec(record).map_err(storage)?;
        let wt = self.db.begin_write().map_err(storage)?;
        {
            let mut table = wt.open_table(TASKS).map_err(storage)?;
            table
                .insert(record.id.as_bytes().as_slice(), value.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> LabResult<Option<TaskRecord>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(TASKS).map_err(storage)?;
        let value = table.get(id.as_bytes().as_slice()).map_err(storage)?;
        value.map(|v| decode(v.value())).transpose()
    }

    /// Read-modify-write one record atomically.
    ///
    /// If `f` fails nothing is written and its error is returned.
    pub fn update<T>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut TaskRecord) -> LabResult<T>,
    ) -> LabResult<(TaskRecord, T)> {
        let wt = self.db.begin_write().map_err(storage)?;
        let (record, out) = {
            let mut table = wt.open_table(TASKS).map_err(storage)?;
            let current = table
                .get(id.as_bytes().as_slice())
                .map_err(storage)?
                .map(|v| decode(v.value()))
                .transpose()?;
            let mut record = current.ok_or_else(|| LabError::TaskNotFound(id.to_string()))?;
            let out = f(&mut record)?;
            record.updated_at = Utc::now();
            let value = serde_json::to_vec(&record).map_err(storage)?;
            table
                .insert(id.as_bytes().as_slice(), value.as_slice())
                .map_err(storage)?;
            (record, out)
        };
        wt.commit().map_err(storage)?;
        Ok((record, out))
    }

    /// All records, oldest first.
    pub fn list_all(&self) -> LabResult<Vec<TaskRecord>> {
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(TASKS).map_err(storage)?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, v) = entry.map_err(storage)?;
            records.push(decode(v.value())?);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Records not yet in a terminal state, oldest first.
    pub fn list_unfinished(&self) -> LabResult<Vec<TaskRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect())
    }

    /// Start-up recovery: tasks left `running` by a crash go back to
    /// `pending`. Returns every unfinished task, ready to be re-enqueued.
    pub fn recover(&self) -> LabResult<Vec<TaskRecord>> {
        let mut unfinished = Vec::new();
        for record in self.list_unfinished()? {
            if record.state == TaskState::Running {
                let (record, ()) = self.update(record.id, |r| {
                    r.transition(TaskState::Pending)?;
                    r.next_attempt_at = None;
                    Ok(())
                })?;
                unfinished.push(record);
            } else {
                unfinished.push(record);
            }
        }
        Ok(unfinished)
    }
}

impl std::fmt::Debug for TaskDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_get_update() {
        let db = TaskDb::in_memory().unwrap();
        let record = TaskRecord::new("pump", "dispense", json!({"axis": "A", "volume": 1.0}));
        db.insert(&record).unwrap();
        assert_eq!(db.get(record.id).unwrap().unwrap(), record);

        let (updated, ()) = db
            .update(record.id, |r| r.transition(TaskState::Running))
            .unwrap();
        assert_eq!(updated.state, TaskState::Running);
        assert_eq!(db.get(record.id).unwrap().unwrap().state, TaskState::Running);
    }

    #[test]
    fn failed_update_writes_nothing() {
        let db = TaskDb::in_memory().unwrap();
        let record = TaskRecord::new("pump", "dispense", json!({}));
        db.insert(&record).unwrap();

        let result = db.update(record.id, |r| {
            r.retries = 99;
            r.transition(TaskState::Succeeded)
        });
        assert!(result.is_err());
        assert_eq!(db.get(record.id).unwrap().unwrap().retries, 0);
    }

    #[test]
    fn unknown_task() {
        let db = TaskDb::in_memory().unwrap();
        let id = uuid::Uuid::new_v4();
        assert!(db.get(id).unwrap().is_none());
        assert!(matches!(
            db.update(id, |_| Ok(())),
            Err(LabError::TaskNotFound(_))
        ));
    }

    #[test]
    fn records_survive_reopen_and_running_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.redb");

        let running = TaskRecord::new("stirrer", "stir", json!({"time": 5}));
        let done = TaskRecord::new("thermo", "read_temperature", json!({}));
        {
            let db = TaskDb::open(&path).unwrap();
            db.insert(&running).unwrap();
            db.insert(&done).unwrap();
            db.update(running.id, |r| r.transition(TaskState::Running)).unwrap();
            db.update(done.id, |r| {
                r.transition(TaskState::Running)?;
                r.succeed(json!({"temperature": 21.5}))
            })
            .unwrap();
        }

        let db = TaskDb::open(&path).unwrap();
        let recovered = db.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, running.id);
        assert_eq!(recovered[0].state, TaskState::Pending);
        assert_eq!(db.get(done.id).unwrap().unwrap().state, TaskState::Succeeded);
    }
}
