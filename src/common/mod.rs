// Shared identifier types used across the engine modules.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Object identifier. Relations, databases, and other cataloged objects are
/// all identified by an oid.
pub type Oid = u32;

pub const INVALID_OID: Oid = 0;

pub type DatabaseId = Oid;
pub type RelationId = Oid;

/// Transaction identifier. Ids below [`FIRST_TRANSACTION_ID`] are reserved
/// so the status log's version stamp never shares a page word with live
/// status bits.
pub type TransactionId = u64;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;
pub const FIRST_TRANSACTION_ID: TransactionId = 512;

/// Command counter within one transaction.
pub type CommandId = u32;

pub const FIRST_COMMAND_ID: CommandId = 0;

/// Block number within a relation file.
pub type BlockNumber = u32;

pub const INVALID_BLOCK: BlockNumber = BlockNumber::MAX;

pub fn block_is_valid(blk: BlockNumber) -> bool {
    blk != INVALID_BLOCK
}

/// Index into a page's item directory. One-based; zero is invalid.
pub type OffsetNumber = u16;

pub const INVALID_OFFSET: OffsetNumber = 0;
pub const FIRST_OFFSET: OffsetNumber = 1;

/// Tuple identifier: the block a tuple lives in plus its slot in that
/// block's item directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleId {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl TupleId {
    pub const INVALID: TupleId = TupleId {
        block: INVALID_BLOCK,
        offset: INVALID_OFFSET,
    };

    pub fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK && self.offset != INVALID_OFFSET
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block, self.offset)
    }
}

/// Relation kind. Index relations may be served from a reserved free list;
/// sequence relations are single-page and written in place; system
/// relations back engine-internal state such as the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelKind {
    Regular,
    Index,
    Sequence,
    System,
}

/// Alignment unit for tuple storage inside pages.
pub const TUPLE_ALIGN: usize = 8;

/// Round `len` up to the tuple storage alignment.
#[inline]
pub const fn max_align(len: usize) -> usize {
    (len + TUPLE_ALIGN - 1) & !(TUPLE_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_align() {
        assert_eq!(max_align(0), 0);
        assert_eq!(max_align(1), 8);
        assert_eq!(max_align(8), 8);
        assert_eq!(max_align(9), 16);
        assert_eq!(max_align(63), 64);
    }

    #[test]
    fn test_tuple_id_validity() {
        assert!(!TupleId::INVALID.is_valid());
        assert!(TupleId::new(0, 1).is_valid());
        assert!(!TupleId::new(0, INVALID_OFFSET).is_valid());
        assert!(!TupleId::new(INVALID_BLOCK, 1).is_valid());
    }

    #[test]
    fn test_first_transaction_clears_version_stamp() {
        // 128 reserved bytes hold 4 status entries each.
        assert!(FIRST_TRANSACTION_ID >= 128 * 4);
    }
}
