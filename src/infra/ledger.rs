//! Durable build-state ledger
//!
//! Persists each package's terminal status in an embedded redb database so
//! an interrupted run can resume without rebuilding finished work. Entries
//! are keyed by package identity; a metadata table carries the recipe-set
//! fingerprint and a monotonic run counter. Every `put` commits its own
//! write transaction, so an entry is durable before the scheduler unlocks
//! any dependent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::core::package::{BuildStatus, PackageId};
use crate::error::LedgerError;

/// Per-package terminal entries, keyed by identity string
const PACKAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

/// Fingerprint and run counter
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const FINGERPRINT_KEY: &str = "fingerprint";
const RUN_COUNTER_KEY: &str = "run_counter";

/// Persisted projection of a package's terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Terminal status
    pub status: BuildStatus,
    /// Error detail for failed/skipped packages
    pub detail: Option<String>,
    /// Run in which the status was recorded
    pub run: u64,
    /// Unix millis when the status was recorded
    pub finished_at: u64,
}

/// Durable key-value store of build outcomes
#[derive(Debug)]
pub struct Ledger {
    db: Database,
    path: PathBuf,
    run: u64,
}

impl Ledger {
    /// Open (or create) the ledger and reconcile it with the recipe set
    ///
    /// If the stored fingerprint matches, prior entries survive and the run
    /// counter increments: already-succeeded packages become pre-satisfied
    /// dependencies. On mismatch the recipe set has changed, so all prior
    /// entries are invalidated rather than silently reused.
    pub fn open(path: &Path, fingerprint: &str) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::Open {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        }

        let db = Database::create(path).map_err(|e| LedgerError::Open {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let open_err = |e: String| LedgerError::Open {
            path: path.to_path_buf(),
            error: e,
        };

        let txn = db.begin_write().map_err(|e| open_err(e.to_string()))?;
        let run;
        {
            let mut meta = txn
                .open_table(META_TABLE)
                .map_err(|e| open_err(e.to_string()))?;

            let stored: Option<String> = meta
                .get(FINGERPRINT_KEY)
                .map_err(|e| open_err(e.to_string()))?
                .map(|guard| String::from_utf8_lossy(guard.value()).into_owned());

            if stored.as_deref() == Some(fingerprint) {
                let counter = meta
                    .get(RUN_COUNTER_KEY)
                    .map_err(|e| open_err(e.to_string()))?
                    .map(|guard| decode_run(guard.value()))
                    .transpose()?
                    .unwrap_or(0);
                run = counter + 1;
                tracing::info!(run, "ledger fingerprint matches; resuming prior state");
            } else {
                if stored.is_some() {
                    tracing::warn!("recipe set changed; invalidating prior ledger entries");
                }
                run = 1;
                meta.insert(FINGERPRINT_KEY, fingerprint.as_bytes())
                    .map_err(|e| open_err(e.to_string()))?;
            }
            meta.insert(RUN_COUNTER_KEY, run.to_be_bytes().as_slice())
                .map_err(|e| open_err(e.to_string()))?;
        }
        if run == 1 {
            // Fresh fingerprint: drop whatever the previous recipe set left.
            txn.delete_table(PACKAGES_TABLE)
                .map_err(|e| open_err(e.to_string()))?;
        }
        {
            // Ensure the table exists even on a brand-new database.
            txn.open_table(PACKAGES_TABLE)
                .map_err(|e| open_err(e.to_string()))?;
        }
        txn.commit().map_err(|e| open_err(e.to_string()))?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            run,
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current run identifier (monotonic per fingerprint)
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Fetch one entry
    pub fn get(&self, id: &PackageId) -> Result<Option<LedgerEntry>, LedgerError> {
        let key = id.to_string();
        let txn = self.db.begin_read().map_err(|e| LedgerError::Read {
            key: key.clone(),
            error: e.to_string(),
        })?;
        let table = txn.open_table(PACKAGES_TABLE).map_err(|e| LedgerError::Read {
            key: key.clone(),
            error: e.to_string(),
        })?;
        let guard = table.get(key.as_str()).map_err(|e| LedgerError::Read {
            key: key.clone(),
            error: e.to_string(),
        })?;
        guard
            .map(|g| decode_entry(&key, g.value()))
            .transpose()
    }

    /// Record one entry, durable before returning
    pub fn put(&self, id: &PackageId, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let key = id.to_string();
        let write_err = |e: String| LedgerError::Write {
            key: key.clone(),
            error: e,
        };

        let bytes = serde_json::to_vec(entry).map_err(|e| LedgerError::Codec {
            key: key.clone(),
            error: e.to_string(),
        })?;

        let txn = self.db.begin_write().map_err(|e| write_err(e.to_string()))?;
        {
            let mut table = txn
                .open_table(PACKAGES_TABLE)
                .map_err(|e| write_err(e.to_string()))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(|e| write_err(e.to_string()))?;
        }
        txn.commit().map_err(|e| write_err(e.to_string()))?;
        Ok(())
    }

    /// All stored entries, keyed by identity string
    pub fn snapshot_all(&self) -> Result<BTreeMap<String, LedgerEntry>, LedgerError> {
        let read_err = |e: String| LedgerError::Read {
            key: "*".to_string(),
            error: e,
        };

        let txn = self.db.begin_read().map_err(|e| read_err(e.to_string()))?;
        let table = txn
            .open_table(PACKAGES_TABLE)
            .map_err(|e| read_err(e.to_string()))?;

        let mut snapshot = BTreeMap::new();
        for item in table.iter().map_err(|e| read_err(e.to_string()))? {
            let (key_guard, value_guard) = item.map_err(|e| read_err(e.to_string()))?;
            let key = key_guard.value().to_string();
            let entry = decode_entry(&key, value_guard.value())?;
            snapshot.insert(key, entry);
        }
        Ok(snapshot)
    }

    /// Identities recorded `Succeeded` by a prior run
    ///
    /// These seed the graph as pre-satisfied dependencies on resume.
    pub fn prior_successes(&self) -> Result<Vec<PackageId>, LedgerError> {
        let mut ids = Vec::new();
        for (key, entry) in self.snapshot_all()? {
            if entry.status == BuildStatus::Succeeded && entry.run < self.run {
                let id = key.parse().map_err(|_| LedgerError::Codec {
                    key: key.clone(),
                    error: "stored key is not a package identity".to_string(),
                })?;
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Read-only view of a ledger file, for the status command
#[derive(Debug)]
pub struct LedgerSnapshot {
    /// Stored recipe-set fingerprint, if any run completed setup
    pub fingerprint: Option<String>,
    /// Last recorded run counter
    pub run: u64,
    /// All stored entries, keyed by identity string
    pub entries: BTreeMap<String, LedgerEntry>,
}

/// Inspect an existing ledger without reconciling or mutating it
pub fn inspect(path: &Path) -> Result<LedgerSnapshot, LedgerError> {
    let open_err = |e: String| LedgerError::Open {
        path: path.to_path_buf(),
        error: e,
    };

    let db = Database::open(path).map_err(|e| open_err(e.to_string()))?;
    let txn = db.begin_read().map_err(|e| open_err(e.to_string()))?;

    let meta = txn
        .open_table(META_TABLE)
        .map_err(|e| open_err(e.to_string()))?;
    let fingerprint = meta
        .get(FINGERPRINT_KEY)
        .map_err(|e| open_err(e.to_string()))?
        .map(|guard| String::from_utf8_lossy(guard.value()).into_owned());
    let run = meta
        .get(RUN_COUNTER_KEY)
        .map_err(|e| open_err(e.to_string()))?
        .map(|guard| decode_run(guard.value()))
        .transpose()?
        .unwrap_or(0);

    let table = txn
        .open_table(PACKAGES_TABLE)
        .map_err(|e| open_err(e.to_string()))?;
    let mut entries = BTreeMap::new();
    for item in table.iter().map_err(|e| open_err(e.to_string()))? {
        let (key_guard, value_guard) = item.map_err(|e| open_err(e.to_string()))?;
        let key = key_guard.value().to_string();
        let entry = decode_entry(&key, value_guard.value())?;
        entries.insert(key, entry);
    }

    Ok(LedgerSnapshot {
        fingerprint,
        run,
        entries,
    })
}

fn decode_entry(key: &str, bytes: &[u8]) -> Result<LedgerEntry, LedgerError> {
    serde_json::from_slice(bytes).map_err(|e| LedgerError::Codec {
        key: key.to_string(),
        error: e.to_string(),
    })
}

fn decode_run(bytes: &[u8]) -> Result<u64, LedgerError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| LedgerError::Codec {
        key: RUN_COUNTER_KEY.to_string(),
        error: format!("run counter has {} bytes, expected 8", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(arr))
}
