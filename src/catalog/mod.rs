// Relation descriptors and the relation cache.
//
// The catalog proper (system relations, tuple descriptors, DDL) lives
// outside the engine core; this module carries only the descriptor surface
// the core consumes: identity, kind, the blob-attribute flag that governs
// oversize-tuple spanning, and open-by-oid/name lookup.

use std::sync::Arc;

use dashmap::DashMap;

use crate::common::{Oid, RelKind};
use crate::error::{Result, StoreError};
use crate::storage::RelFileNode;

/// Cached descriptor for one relation.
#[derive(Debug)]
pub struct Relation {
    pub oid: Oid,
    pub db: Oid,
    pub name: String,
    pub kind: RelKind,
    /// True when the relation has a blob attribute: oversize tuples are
    /// spanned into segment pages instead of being rejected.
    pub has_blob_attr: bool,
}

pub type RelationRef = Arc<Relation>;

impl Relation {
    pub fn node(&self) -> RelFileNode {
        RelFileNode::new(self.db, self.oid)
    }

    pub fn is_index(&self) -> bool {
        self.kind == RelKind::Index
    }
}

/// Open-relation cache keyed by oid.
pub struct RelationCache {
    by_oid: DashMap<Oid, RelationRef>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self {
            by_oid: DashMap::new(),
        }
    }

    /// Register a relation descriptor and return the shared handle.
    pub fn define(
        &self,
        oid: Oid,
        db: Oid,
        name: &str,
        kind: RelKind,
        has_blob_attr: bool,
    ) -> RelationRef {
        let rel = Arc::new(Relation {
            oid,
            db,
            name: name.to_string(),
            kind,
            has_blob_attr,
        });
        self.by_oid.insert(oid, Arc::clone(&rel));
        rel
    }

    pub fn open(&self, oid: Oid) -> Result<RelationRef> {
        self.by_oid
            .get(&oid)
            .map(|r| Arc::clone(&r))
            .ok_or(StoreError::UnknownRelation(oid))
    }

    pub fn open_by_name(&self, db: Oid, name: &str) -> Result<RelationRef> {
        self.by_oid
            .iter()
            .find(|r| r.db == db && r.name == name)
            .map(|r| Arc::clone(&r))
            .ok_or(StoreError::UnknownRelation(0))
    }

    pub fn close(&self, oid: Oid) {
        self.by_oid.remove(&oid);
    }

    /// Drop every cached descriptor belonging to a database.
    pub fn forget_db(&self, db: Oid) {
        self.by_oid.retain(|_, r| r.db != db);
    }
}

impl Default for RelationCache {
    fn default() -> Self {
        Self::new()
    }
}
