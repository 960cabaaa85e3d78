//! Clustered and secondary index collaborator surface.
//!
//! The undo and purge executors operate against an index layer they do not
//! own. This module provides that layer as an in-memory table store: a
//! clustered index keyed by primary key, holding the single current version
//! of each row (transaction id, roll pointer, delete-mark), and secondary
//! indexes whose entries are shared references across row versions.
//!
//! Physical deletes model the optimistic/pessimistic split of a real tree:
//! an optimistic (leaf-only) delete can report that restructuring is needed,
//! and the pessimistic path can run out of space. Both conditions are
//! injectable for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use quarry_error::{QuarryError, Result};
use quarry_types::{IndexEntry, IndexId, RollPtr, RowImage, TableId, TrxId, Value};

/// Hidden system columns carried by every clustered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecHdr {
    /// Id of the transaction that wrote this version.
    pub trx_id: TrxId,
    /// Reference to the undo record holding the previous version.
    pub roll_ptr: RollPtr,
    pub del_marked: bool,
}

/// The current version of a row in the clustered index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusteredRec {
    pub hdr: RecHdr,
    pub row: RowImage,
}

/// One secondary-index entry. Shared by every row version whose projection
/// matches it; carries only a delete-mark, never per-version data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecRec {
    pub key: Vec<Value>,
    pub pk: Vec<Value>,
    pub del_marked: bool,
}

/// Result of a physical secondary-index delete attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// No entry under that key; already resolved.
    NotFound,
    /// Leaf-only delete insufficient; the pessimistic path must run.
    NeedsRestructure,
}

/// Definition of one secondary index.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    /// Row columns forming the index key, in key order.
    pub key_cols: Vec<u32>,
}

impl IndexDef {
    /// Project `row` onto this index, pairing the key with `pk`.
    #[must_use]
    pub fn entry_for(&self, row: &RowImage, pk: &[Value]) -> IndexEntry {
        IndexEntry {
            key: row.project(&self.key_cols),
            pk: pk.to_vec(),
        }
    }
}

/// Static shape of one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    /// Row columns forming the primary key.
    pub pk_cols: Vec<u32>,
    pub secondaries: Vec<IndexDef>,
}

#[derive(Debug)]
struct Indexes {
    /// Current row versions, keyed by primary key (binary order).
    clustered: BTreeMap<Vec<Value>, ClusteredRec>,
    /// Per-index entries keyed by `(key, pk)`.
    sec: HashMap<IndexId, BTreeMap<(Vec<Value>, Vec<Value>), SecRec>>,
}

/// One table: schema plus its index trees.
#[derive(Debug)]
pub struct Table {
    pub schema: TableSchema,
    idx: Mutex<Indexes>,
    /// Next N optimistic deletes report [`DeleteOutcome::NeedsRestructure`].
    force_restructure: AtomicU32,
    /// Next N pessimistic deletes fail with out-of-space.
    force_delete_oom: AtomicU32,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        let sec = schema
            .secondaries
            .iter()
            .map(|def| (def.id, BTreeMap::new()))
            .collect();
        Self {
            schema,
            idx: Mutex::new(Indexes {
                clustered: BTreeMap::new(),
                sec,
            }),
            force_restructure: AtomicU32::new(0),
            force_delete_oom: AtomicU32::new(0),
        }
    }

    /// Primary key of `row` under this table's schema.
    #[must_use]
    pub fn pk_of(&self, row: &RowImage) -> Vec<Value> {
        row.project(&self.schema.pk_cols)
    }

    // --- clustered index ---

    pub fn read_clustered(&self, pk: &[Value]) -> Option<ClusteredRec> {
        self.idx.lock().clustered.get(pk).cloned()
    }

    /// Insert a fresh clustered record. Fails on an occupied, not
    /// delete-marked key.
    pub fn insert_clustered(&self, pk: Vec<Value>, rec: ClusteredRec) -> Result<()> {
        let mut idx = self.idx.lock();
        match idx.clustered.get(&pk) {
            Some(existing) if !existing.hdr.del_marked => Err(QuarryError::DuplicateKey {
                table: self.schema.id,
            }),
            _ => {
                idx.clustered.insert(pk, rec);
                Ok(())
            }
        }
    }

    /// Install `rec` under `pk` unconditionally (rollback restore path).
    pub fn overwrite_clustered(&self, pk: Vec<Value>, rec: ClusteredRec) {
        self.idx.lock().clustered.insert(pk, rec);
    }

    /// Mutate the record under `pk` in place. Returns false when absent.
    pub fn update_clustered<F>(&self, pk: &[Value], f: F) -> bool
    where
        F: FnOnce(&mut ClusteredRec),
    {
        match self.idx.lock().clustered.get_mut(pk) {
            Some(rec) => {
                f(rec);
                true
            }
            None => false,
        }
    }

    /// Physically remove the record under `pk` iff its roll pointer still
    /// equals `expected`. Returns whether a removal happened.
    pub fn remove_clustered_if(&self, pk: &[Value], expected: RollPtr) -> bool {
        let mut idx = self.idx.lock();
        if idx
            .clustered
            .get(pk)
            .map_or(false, |rec| rec.hdr.roll_ptr == expected)
        {
            idx.clustered.remove(pk);
            true
        } else {
            false
        }
    }

    // --- secondary indexes ---

    pub fn insert_sec(&self, index: IndexId, key: Vec<Value>, pk: Vec<Value>) -> Result<()> {
        let mut idx = self.idx.lock();
        let tree = idx.sec.get_mut(&index).ok_or(QuarryError::NoSuchTable {
            table: self.schema.id,
        })?;
        tree.insert(
            (key.clone(), pk.clone()),
            SecRec {
                key,
                pk,
                del_marked: false,
            },
        );
        Ok(())
    }

    pub fn sec_entry(&self, index: IndexId, key: &[Value], pk: &[Value]) -> Option<SecRec> {
        self.idx
            .lock()
            .sec
            .get(&index)?
            .get(&(key.to_vec(), pk.to_vec()))
            .cloned()
    }

    /// Set the delete-mark of one entry. Returns false when absent.
    pub fn mark_sec(&self, index: IndexId, key: &[Value], pk: &[Value], del_marked: bool) -> bool {
        let mut idx = self.idx.lock();
        match idx
            .sec
            .get_mut(&index)
            .and_then(|tree| tree.get_mut(&(key.to_vec(), pk.to_vec())))
        {
            Some(entry) => {
                entry.del_marked = del_marked;
                true
            }
            None => false,
        }
    }

    /// Leaf-only physical delete.
    pub fn delete_sec_optimistic(
        &self,
        index: IndexId,
        key: &[Value],
        pk: &[Value],
    ) -> DeleteOutcome {
        if take_one(&self.force_restructure) {
            return DeleteOutcome::NeedsRestructure;
        }
        self.delete_sec_inner(index, key, pk)
    }

    /// Tree-restructuring physical delete. Can run out of space.
    pub fn delete_sec_pessimistic(
        &self,
        index: IndexId,
        key: &[Value],
        pk: &[Value],
    ) -> Result<DeleteOutcome> {
        if take_one(&self.force_delete_oom) {
            return Err(QuarryError::TablespaceFull);
        }
        Ok(self.delete_sec_inner(index, key, pk))
    }

    fn delete_sec_inner(&self, index: IndexId, key: &[Value], pk: &[Value]) -> DeleteOutcome {
        let mut idx = self.idx.lock();
        match idx
            .sec
            .get_mut(&index)
            .and_then(|tree| tree.remove(&(key.to_vec(), pk.to_vec())))
        {
            Some(_) => DeleteOutcome::Removed,
            None => DeleteOutcome::NotFound,
        }
    }

    /// All entries of one secondary index, key order.
    pub fn sec_entries(&self, index: IndexId) -> Vec<SecRec> {
        self.idx
            .lock()
            .sec
            .get(&index)
            .map(|tree| tree.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn n_rows(&self) -> usize {
        self.idx.lock().clustered.len()
    }

    // --- test hooks ---

    /// Make the next `n` optimistic deletes demand restructuring.
    pub fn inject_restructure(&self, n: u32) {
        self.force_restructure.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` pessimistic deletes fail with out-of-space.
    pub fn inject_delete_oom(&self, n: u32) {
        self.force_delete_oom.store(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Registry of tables by id.
#[derive(Default)]
#[derive(Debug)]
pub struct TableStore {
    tables: RwLock<BTreeMap<TableId, Arc<Table>>>,
}

impl TableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if tables.contains_key(&schema.id) {
            return Err(QuarryError::DuplicateKey { table: schema.id });
        }
        let table = Arc::new(Table::new(schema));
        tables.insert(table.schema.id, Arc::clone(&table));
        Ok(table)
    }

    pub fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or(QuarryError::NoSuchTable { table: id })
    }
}
