// Heap tuples and heap page I/O.

pub mod freespace;
pub mod hio;
pub mod visibility;

use crate::common::{
    CommandId, TransactionId, TupleId, INVALID_TRANSACTION_ID,
};
use crate::error::{Result, StoreError};

pub use freespace::FreeSpaceDirectory;
pub use hio::Heap;
pub use visibility::{LogVisibility, Snapshot, SnapshotKind, UpdateStatus, VisibilityOracle};

// Tuple info flag bits.
/// The tuple's payload was accumulated through a buffered source and its
/// segments must be re-spanned before the header is placed.
pub const TUPLE_HAS_BUFFERED: u16 = 1 << 0;
/// Read-only retrieval: served from a thread-private buffer outside the
/// shared pool.
pub const TUPLE_READONLY: u16 = 1 << 1;
/// Header tuple of a spanned oversize value; its payload is a segment
/// reference, not user data.
pub const TUPLE_BLOB_HEAD: u16 = 1 << 2;
/// One segment of a spanned oversize value.
pub const TUPLE_BLOB_SEGMENT: u16 = 1 << 3;
/// The deleting transaction removed the row rather than replacing it.
pub const TUPLE_DELETED: u16 = 1 << 4;

/// Serialized tuple header size: self-TID, insert/delete transactions and
/// command ids, flags, and the payload length.
pub const TUPLE_HEADER_SIZE: usize = 40;

/// A heap tuple: header plus payload. The struct is the in-memory form;
/// `serialize`/`deserialize` define the on-page layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapTuple {
    pub self_tid: TupleId,
    pub xmin: TransactionId,
    pub cmin: CommandId,
    pub xmax: TransactionId,
    pub cmax: CommandId,
    pub info: u16,
    pub data: Vec<u8>,
}

impl HeapTuple {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            self_tid: TupleId::INVALID,
            xmin: INVALID_TRANSACTION_ID,
            cmin: 0,
            xmax: INVALID_TRANSACTION_ID,
            cmax: 0,
            info: 0,
            data,
        }
    }

    pub fn with_insert(data: Vec<u8>, xmin: TransactionId, cmin: CommandId) -> Self {
        let mut t = Self::new(data);
        t.xmin = xmin;
        t.cmin = cmin;
        t
    }

    /// Bytes this tuple occupies on a page, before alignment.
    pub fn stored_len(&self) -> usize {
        TUPLE_HEADER_SIZE + self.data.len()
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.info & flag != 0
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stored_len());
        out.extend_from_slice(&self.self_tid.block.to_le_bytes());
        out.extend_from_slice(&self.self_tid.offset.to_le_bytes());
        out.extend_from_slice(&self.info.to_le_bytes());
        out.extend_from_slice(&self.xmin.to_le_bytes());
        out.extend_from_slice(&self.xmax.to_le_bytes());
        out.extend_from_slice(&self.cmin.to_le_bytes());
        out.extend_from_slice(&self.cmax.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        debug_assert_eq!(out.len(), TUPLE_HEADER_SIZE);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TUPLE_HEADER_SIZE {
            return Err(StoreError::Internal(format!(
                "tuple image of {} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let block = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let offset = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let info = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        let xmin = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let xmax = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let cmin = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let cmax = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
        let len = u32::from_le_bytes(bytes[32..36].try_into().unwrap()) as usize;
        if bytes.len() < TUPLE_HEADER_SIZE + len {
            return Err(StoreError::Internal(
                "tuple image is shorter than its recorded length".into(),
            ));
        }
        Ok(Self {
            self_tid: TupleId::new(block, offset),
            xmin,
            cmin,
            xmax,
            cmax,
            info,
            data: bytes[TUPLE_HEADER_SIZE..TUPLE_HEADER_SIZE + len].to_vec(),
        })
    }

    /// Patch the self-TID of an already-serialized tuple image in place.
    pub(crate) fn write_tid(image: &mut [u8], tid: TupleId) {
        image[0..4].copy_from_slice(&tid.block.to_le_bytes());
        image[4..6].copy_from_slice(&tid.offset.to_le_bytes());
    }
}

/// Payload of a blob head tuple: where the segments start, how much data
/// they carry, and how many there are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    pub first: TupleId,
    pub total_len: u64,
    pub segments: u32,
}

impl BlobRef {
    pub const ENCODED_LEN: usize = 20;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.first.block.to_le_bytes());
        out.extend_from_slice(&self.first.offset.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.total_len.to_le_bytes());
        out.extend_from_slice(&self.segments.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(StoreError::Internal("short blob reference".into()));
        }
        Ok(Self {
            first: TupleId::new(
                u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            ),
            total_len: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            segments: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}
