//! Persistent run history using redb.
//!
//! A single `RUNS` table maps `run_id` to the JSON-encoded [`Run`]. Records
//! are written when a run is created and again when it reaches a terminal
//! status; they are never deleted.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Result, RunbookError};
use crate::run::{Run, RunEvent};

const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

fn store_err(e: impl std::fmt::Display) -> RunbookError {
    RunbookError::Store(e.to_string())
}

/// Where the coordinator keeps run records.
pub trait RunHistory: Send + Sync + 'static {
    fn put(&self, run: &Run) -> Result<()>;
    fn get(&self, run_id: &str) -> Result<Option<Run>>;
    /// All runs, newest first.
    fn list(&self) -> Result<Vec<Run>>;
}

pub struct RunStore {
    db: Database,
}

impl RunStore {
    /// Open or create the database at `path`, creating the table if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(RUNS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Insert or overwrite the record for `run.run_id`.
    pub fn put(&self, run: &Run) -> Result<()> {
        let value = serde_json::to_vec(run)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(RUNS).map_err(store_err)?;
            table
                .insert(run.run_id.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<Run>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(RUNS).map_err(store_err)?;
        match table.get(run_id).map_err(store_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All runs, newest first.
    pub fn list(&self) -> Result<Vec<Run>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(RUNS).map_err(store_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let run: Run = serde_json::from_slice(v.value())?;
            result.push(run);
        }
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    /// On startup, close out runs left open by a previous process.
    ///
    /// No worker drives them any more, so they are moved to `Error`.
    /// Returns the number of runs recovered.
    pub fn startup_recovery(&self) -> Result<u32> {
        let mut count = 0u32;
        for mut run in self.list()? {
            if run.is_terminal() {
                continue;
            }
            run.apply(&RunEvent::Error {
                message: "coordinator restarted before the run finished".into(),
            });
            self.put(&run)?;
            count += 1;
        }
        Ok(count)
    }
}

impl RunHistory for RunStore {
    fn put(&self, run: &Run) -> Result<()> {
        RunStore::put(self, run)
    }

    fn get(&self, run_id: &str) -> Result<Option<Run>> {
        RunStore::get(self, run_id)
    }

    fn list(&self) -> Result<Vec<Run>> {
        RunStore::list(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
