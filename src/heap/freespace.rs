// Advisory free-space directory.
//
// Tracks an estimate of usable space per heap block. The numbers are
// advisory: concurrent inserts age them, so heap placement re-checks the
// real free space under the exclusive page lock and deactivates entries
// that turned out stale. An empty directory extends the relation.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::catalog::Relation;
use crate::common::BlockNumber;
use crate::error::Result;
use crate::storage::RelFileNode;

pub struct FreeSpaceDirectory {
    map: DashMap<RelFileNode, BTreeMap<BlockNumber, usize>>,
}

impl FreeSpaceDirectory {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Find a block believed to hold at least `needed` bytes, at or after
    /// `from`. Extends the relation when nothing qualifies.
    pub fn get_freespace(
        &self,
        rel: &Relation,
        pool: &Arc<BufferPool>,
        needed: usize,
        from: BlockNumber,
    ) -> Result<BlockNumber> {
        if let Some(spaces) = self.map.get(&rel.node()) {
            for (&blk, &avail) in spaces.range(from..) {
                if avail >= needed {
                    return Ok(blk);
                }
            }
        }
        let blk = pool.extend_relation(rel)?;
        Ok(blk)
    }

    /// Record the observed free space of a block.
    pub fn note_freespace(&self, rel: &Relation, blk: BlockNumber, avail: usize) {
        self.map.entry(rel.node()).or_default().insert(blk, avail);
    }

    /// Correct a stale entry: the block actually has `actual` bytes free,
    /// which was not enough for the requester.
    pub fn deactivate_freespace(&self, rel: &Relation, blk: BlockNumber, actual: usize) {
        if let Some(mut spaces) = self.map.get_mut(&rel.node()) {
            spaces.insert(blk, actual);
        }
    }

    pub fn forget_rel(&self, node: RelFileNode) {
        self.map.remove(&node);
    }
}

impl Default for FreeSpaceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RelKind;
    use crate::storage::FileStorage;
    use crate::EngineConfig;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, Arc<BufferPool>, Relation, FreeSpaceDirectory) {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            buffers: 4,
            max_buffers: 8,
            ..EngineConfig::default()
        };
        let smgr = Arc::new(FileStorage::new(dir.path(), config.page_size).unwrap());
        let pool = BufferPool::new(smgr, &config);
        let rel = Relation {
            oid: 40,
            db: 1,
            name: "fs".into(),
            kind: RelKind::Regular,
            has_blob_attr: false,
        };
        (dir, pool, rel, FreeSpaceDirectory::new())
    }

    #[test]
    fn test_empty_directory_extends() {
        let (_d, pool, rel, fsd) = fixture();
        let blk = fsd.get_freespace(&rel, &pool, 100, 0).unwrap();
        assert_eq!(blk, 0);
        assert_eq!(pool.nblocks(&rel).unwrap(), 1);
    }

    #[test]
    fn test_noted_space_is_found() {
        let (_d, pool, rel, fsd) = fixture();
        fsd.note_freespace(&rel, 3, 500);
        assert_eq!(fsd.get_freespace(&rel, &pool, 400, 0).unwrap(), 3);
        // A larger request ignores the entry and extends instead.
        assert_eq!(fsd.get_freespace(&rel, &pool, 600, 0).unwrap(), 0);
    }

    #[test]
    fn test_limit_block_is_respected() {
        let (_d, pool, rel, fsd) = fixture();
        fsd.note_freespace(&rel, 1, 500);
        fsd.note_freespace(&rel, 5, 500);
        assert_eq!(fsd.get_freespace(&rel, &pool, 400, 2).unwrap(), 5);
    }

    #[test]
    fn test_deactivate_makes_entry_unattractive() {
        let (_d, pool, rel, fsd) = fixture();
        fsd.note_freespace(&rel, 2, 500);
        fsd.deactivate_freespace(&rel, 2, 8);
        // Entry now reports 8 bytes; the request falls through to extend.
        assert_eq!(fsd.get_freespace(&rel, &pool, 400, 0).unwrap(), 0);
    }
}
