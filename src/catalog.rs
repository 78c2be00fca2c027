//! C2: the table catalog (spec section 4.2).
//!
//! Maps table names to table ids, tracks each table's declared partition
//! tag, and hands out ids from a counter that must survive checkpoints and
//! log replay. Guarded by a single mutex, acquired briefly per operation -
//! spec section 5 calls this out explicitly as the catalog's concurrency
//! discipline.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CResult, Error};

/// The two partition tags a table can declare. The engine treats both as
/// plain ordered maps - the tag is declarative only (spec section 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    Hash,
    Range,
}

impl Partition {
    pub fn parse(s: &str) -> CResult<Self> {
        match s {
            "hash" => Ok(Partition::Hash),
            "range" => Ok(Partition::Range),
            other => Err(Error::InvalidPartitionMethod(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Hash => "hash",
            Partition::Range => "range",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TableMeta {
    pub id: u64,
    pub name: String,
    pub partition: Partition,
}

struct Inner {
    tables: HashMap<u64, TableMeta>,
    name_to_id: HashMap<String, u64>,
    next_table_id: u64,
}

/// The table catalog. Cheap to share: clone the `Arc` that wraps it, never
/// the catalog itself.
pub struct Catalog {
    inner: Mutex<Inner>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog {
            inner: Mutex::new(Inner {
                tables: HashMap::new(),
                name_to_id: HashMap::new(),
                next_table_id: 1,
            }),
        }
    }

    /// Rebuilds a catalog from a checkpoint snapshot (spec section 4.9):
    /// restores the table list and the monotonic id counter verbatim.
    pub fn from_snapshot(next_table_id: u64, tables: Vec<TableMeta>) -> Self {
        let mut name_to_id = HashMap::with_capacity(tables.len());
        let mut by_id = HashMap::with_capacity(tables.len());
        for t in tables {
            name_to_id.insert(t.name.clone(), t.id);
            by_id.insert(t.id, t);
        }
        Catalog {
            inner: Mutex::new(Inner { tables: by_id, name_to_id, next_table_id }),
        }
    }

    pub fn create_table(&self, name: &str, partition: &str) -> CResult<u64> {
        let partition = Partition::parse(partition)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.name_to_id.contains_key(name) {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        let id = inner.next_table_id;
        inner.next_table_id += 1;
        inner.name_to_id.insert(name.to_string(), id);
        inner.tables.insert(id, TableMeta { id, name: name.to_string(), partition });
        Ok(id)
    }

    /// Used by WAL replay to recreate a table under the exact id the log
    /// recorded (spec section 4.9: `CREATE_TABLE` replays verbatim).
    pub fn create_table_with_id(&self, name: &str, partition: &str, id: u64) -> CResult<()> {
        let partition = Partition::parse(partition)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.name_to_id.contains_key(name) {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        inner.name_to_id.insert(name.to_string(), id);
        inner.tables.insert(id, TableMeta { id, name: name.to_string(), partition });
        if id >= inner.next_table_id {
            inner.next_table_id = id + 1;
        }
        Ok(())
    }

    pub fn drop_table(&self, id: u64) -> CResult<TableMeta> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tables.remove(&id) {
            Some(meta) => {
                inner.name_to_id.remove(&meta.name);
                Ok(meta)
            }
            None => Err(Error::TableNotFound(id.to_string())),
        }
    }

    pub fn get_table_name(&self, id: u64) -> CResult<String> {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(&id).map(|t| t.name.clone()).ok_or(Error::TableNotFound(id.to_string()))
    }

    pub fn get_table_id(&self, name: &str) -> CResult<u64> {
        let inner = self.inner.lock().unwrap();
        inner.name_to_id.get(name).copied().ok_or(Error::TableNotFound(name.to_string()))
    }

    pub fn get_partition(&self, id: u64) -> CResult<Partition> {
        let inner = self.inner.lock().unwrap();
        inner.tables.get(&id).map(|t| t.partition).ok_or(Error::TableNotFound(id.to_string()))
    }

    pub fn list_tables(&self) -> Vec<(String, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(String, u64)> =
            inner.tables.values().map(|t| (t.name.clone(), t.id)).collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    pub fn exists(&self, id: u64) -> bool {
        self.inner.lock().unwrap().tables.contains_key(&id)
    }

    /// Snapshot of the catalog state for checkpointing (spec section 6).
    pub fn snapshot(&self) -> (u64, Vec<TableMeta>) {
        let inner = self.inner.lock().unwrap();
        let mut tables: Vec<TableMeta> = inner.tables.values().cloned().collect();
        tables.sort_by(|a, b| a.id.cmp(&b.id));
        (inner.next_table_id, tables)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_drop_returns_to_pre_create_state() {
        let cat = Catalog::new();
        let id = cat.create_table("t", "hash").unwrap();
        assert_eq!(cat.get_table_id("t").unwrap(), id);
        cat.drop_table(id).unwrap();
        assert!(matches!(cat.get_table_id("t"), Err(Error::TableNotFound(_))));
    }

    #[test]
    fn duplicate_name_rejected() {
        let cat = Catalog::new();
        cat.create_table("t", "hash").unwrap();
        assert!(matches!(cat.create_table("t", "range"), Err(Error::TableAlreadyExists(_))));
    }

    #[test]
    fn invalid_partition_rejected() {
        let cat = Catalog::new();
        assert!(matches!(
            cat.create_table("t", "weird"),
            Err(Error::InvalidPartitionMethod(_))
        ));
    }

    #[test]
    fn drop_missing_table_not_found() {
        let cat = Catalog::new();
        assert!(matches!(cat.drop_table(999), Err(Error::TableNotFound(_))));
    }

    #[test]
    fn ids_are_monotonic_and_names_reusable_after_drop() {
        let cat = Catalog::new();
        let id1 = cat.create_table("t", "hash").unwrap();
        cat.drop_table(id1).unwrap();
        let id2 = cat.create_table("t", "hash").unwrap();
        assert!(id2 > id1);
    }
}
