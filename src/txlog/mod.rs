// Transaction status log.
//
// Every transaction's outcome is two bits in a packed on-disk map: a status
// page holds `statuses_per_block` entries, 32 per little-endian u64 word.
// Block addressing is relative to the low-water mark, so vacuuming the log
// physically drops whole leading blocks and re-bases the arithmetic; an id
// below the mark is implicitly committed.
//
// Word updates take one global spinlock instead of a page lock: a status
// write is a single word's clear-and-or, and the soft-commit to commit
// upgrade only ever sets bits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::buffer::{BufferPool, BufferRef};
use crate::catalog::RelationRef;
use crate::common::{BlockNumber, TransactionId, FIRST_TRANSACTION_ID};
use crate::error::{Result, StoreError};
use crate::storage::{FileStorage, PAGE_HEADER_SIZE};

/// Version stamp written into the first bytes of the log relation.
pub const LOG_SYSTEM_VERSION: u32 = 200;

/// Bytes reserved at the start of the log for the version stamp.
/// Transaction ids start at 512 so live status bits never land here.
pub const LOG_RESERVED_BYTES: usize = 128;

/// A physical block address beyond this is treated as corruption and the
/// transaction reported aborted.
const MAX_LOG_BLOCK: BlockNumber = 32 * 1024;

/// Block count that triggers an operator warning to vacuum.
const LARGE_LOG_BLOCKS: BlockNumber = 8192;

const STATUSES_PER_WORD: u64 = 32;

/// Two-bit transaction status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XidStatus {
    InProgress = 0b00,
    Aborted = 0b01,
    SoftCommit = 0b10,
    Committed = 0b11,
}

impl XidStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b00 => XidStatus::InProgress,
            0b01 => XidStatus::Aborted,
            0b10 => XidStatus::SoftCommit,
            _ => XidStatus::Committed,
        }
    }

    /// True for soft or hard commit.
    pub fn is_committed(&self) -> bool {
        matches!(self, XidStatus::SoftCommit | XidStatus::Committed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, XidStatus::Aborted | XidStatus::Committed)
    }

    /// The monotonic status machine: in-progress may soft-commit, commit,
    /// or abort; a soft commit may only harden into a commit; terminal
    /// states accept nothing but themselves.
    fn may_become(&self, new: XidStatus) -> bool {
        if *self == new {
            return true;
        }
        matches!(
            (*self, new),
            (XidStatus::InProgress, _) | (XidStatus::SoftCommit, XidStatus::Committed)
        )
    }
}

/// Control-page image: version, next transaction id, low-water mark.
struct ControlData {
    version: u32,
    next_xid: TransactionId,
    low_water: TransactionId,
}

/// How many transaction ids one allocation batch claims before the control
/// page is rewritten.
const XID_PREFETCH: u64 = 512;

pub struct TransactionLog {
    rel: RelationRef,
    control_rel: RelationRef,
    pool: Arc<BufferPool>,
    smgr: Arc<FileStorage>,
    /// Spinlock over packed word updates.
    xid_set_lock: Mutex<()>,
    /// Serializes control-page rewrites so the persisted fence never
    /// regresses.
    control_lock: Mutex<()>,
    low_water: AtomicU64,
    next_xid: AtomicU64,
    /// Ids below this are already claimed on the control page.
    xid_fence: AtomicU64,
    multiuser: bool,
    statuses_per_block: u64,
}

impl TransactionLog {
    /// Open or create the log and control relations.
    pub fn open(
        rel: RelationRef,
        control_rel: RelationRef,
        pool: Arc<BufferPool>,
        smgr: Arc<FileStorage>,
        multiuser: bool,
    ) -> Result<Self> {
        let page_size = smgr.page_size();
        let statuses_per_block = ((page_size - PAGE_HEADER_SIZE) * 4) as u64;

        let log = Self {
            rel,
            control_rel,
            pool,
            smgr,
            xid_set_lock: Mutex::new(()),
            control_lock: Mutex::new(()),
            low_water: AtomicU64::new(0),
            next_xid: AtomicU64::new(FIRST_TRANSACTION_ID),
            xid_fence: AtomicU64::new(0),
            multiuser,
            statuses_per_block,
        };
        log.bootstrap()?;
        Ok(log)
    }

    fn bootstrap(&self) -> Result<()> {
        if self.pool.nblocks(&self.control_rel)? == 0 {
            // Fresh system: stamp the control page and the log's reserved
            // leader.
            self.pool.extend_relation(&self.control_rel)?;
            self.write_control(ControlData {
                version: LOG_SYSTEM_VERSION,
                next_xid: FIRST_TRANSACTION_ID,
                low_water: 0,
            })?;
            self.ensure_block(0)?;
            let buf = self.pool.read_buffer(&self.rel, 0, false)?;
            buf.with_page_mut(|p| {
                let body = &mut p.as_bytes_mut()[PAGE_HEADER_SIZE..];
                body[..4].copy_from_slice(&LOG_SYSTEM_VERSION.to_le_bytes());
            });
            self.pool.flush_buffer(buf)?;
        } else {
            let control = self.read_control()?;
            if control.version != LOG_SYSTEM_VERSION {
                return Err(StoreError::Config(format!(
                    "transaction log version {} does not match {}",
                    control.version, LOG_SYSTEM_VERSION
                )));
            }
            self.low_water.store(control.low_water, Ordering::SeqCst);
            self.next_xid.store(control.next_xid, Ordering::SeqCst);
            self.xid_fence.store(control.next_xid, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_control(&self) -> Result<ControlData> {
        let buf = self.pool.read_buffer(&self.control_rel, 0, false)?;
        let data = buf.with_page(|p| {
            let body = &p.as_bytes()[PAGE_HEADER_SIZE..];
            ControlData {
                version: u32::from_le_bytes(body[0..4].try_into().unwrap()),
                next_xid: u64::from_le_bytes(body[8..16].try_into().unwrap()),
                low_water: u64::from_le_bytes(body[16..24].try_into().unwrap()),
            }
        });
        self.pool.release_buffer(buf);
        Ok(data)
    }

    fn write_control(&self, data: ControlData) -> Result<()> {
        let buf = self.pool.read_buffer(&self.control_rel, 0, false)?;
        buf.with_page_mut(|p| {
            let body = &mut p.as_bytes_mut()[PAGE_HEADER_SIZE..];
            body[0..4].copy_from_slice(&data.version.to_le_bytes());
            body[8..16].copy_from_slice(&data.next_xid.to_le_bytes());
            body[16..24].copy_from_slice(&data.low_water.to_le_bytes());
        });
        self.pool.flush_buffer(buf)
    }

    pub fn low_water_mark(&self) -> TransactionId {
        self.low_water.load(Ordering::SeqCst)
    }

    /// Hand out the next transaction id, claiming a batch on the control
    /// page whenever the fence is reached.
    pub fn allocate_xid(&self) -> Result<TransactionId> {
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        if xid >= self.xid_fence.load(Ordering::SeqCst) {
            let _guard = self.control_lock.lock();
            if xid >= self.xid_fence.load(Ordering::SeqCst) {
                let claim = self.next_xid.load(Ordering::SeqCst).max(xid + 1) + XID_PREFETCH;
                self.write_control(ControlData {
                    version: LOG_SYSTEM_VERSION,
                    next_xid: claim,
                    low_water: self.low_water_mark(),
                })?;
                self.xid_fence.store(claim, Ordering::SeqCst);
            }
        }
        Ok(xid)
    }

    /// Physical block of a transaction's status bits, relative to the
    /// low-water mark. `None` means the id is below the mark.
    fn block_for(&self, xid: TransactionId) -> Option<BlockNumber> {
        let per = self.statuses_per_block;
        let removed = self.low_water_mark() / per;
        let absolute = xid / per;
        if absolute < removed {
            return None;
        }
        let block = (absolute - removed) as BlockNumber;
        if block > LARGE_LOG_BLOCKS {
            warn!(block, "transaction log is very large; vacuum soon");
        }
        Some(block)
    }

    fn ensure_block(&self, block: BlockNumber) -> Result<()> {
        while self.pool.nblocks(&self.rel)? <= block {
            self.pool.extend_relation(&self.rel)?;
        }
        Ok(())
    }

    fn word_position(&self, xid: TransactionId) -> (usize, u32) {
        let index = xid % self.statuses_per_block;
        let word = (index / STATUSES_PER_WORD) as usize;
        let shift = 62 - 2 * (index % STATUSES_PER_WORD) as u32;
        (PAGE_HEADER_SIZE + word * 8, shift)
    }

    fn read_word(buf: &BufferRef, offset: usize) -> u64 {
        buf.with_page(|p| {
            let bytes = &p.as_bytes()[offset..offset + 8];
            u64::from_le_bytes(bytes.try_into().unwrap())
        })
    }

    fn write_word(buf: &BufferRef, offset: usize, value: u64) {
        buf.with_page_mut(|p| {
            p.as_bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        });
    }

    /// Read a transaction's status.
    pub fn status_of(&self, xid: TransactionId) -> Result<XidStatus> {
        if xid < FIRST_TRANSACTION_ID {
            return Err(StoreError::Internal(format!(
                "status requested for invalid transaction id {xid}"
            )));
        }
        if xid < self.low_water_mark() {
            return Ok(XidStatus::Committed);
        }
        let block = match self.block_for(xid) {
            Some(block) => block,
            None => return Ok(XidStatus::Committed),
        };
        if block > MAX_LOG_BLOCK {
            // Defensive: a block this far out means a corrupted id. Report
            // the transaction aborted rather than extending the log.
            error!(xid, block, "transaction log block out of range");
            return Ok(XidStatus::Aborted);
        }
        self.ensure_block(block)?;

        let buf = self.pool.read_buffer(&self.rel, block, false)?;
        if buf.has_error() {
            let rel = self.rel.oid;
            self.pool.release_buffer(buf);
            return Err(StoreError::BadBuffer {
                relation: rel,
                block,
            });
        }
        let (offset, shift) = self.word_position(xid);
        let status = {
            let _spin = self.xid_set_lock.lock();
            XidStatus::from_bits(Self::read_word(&buf, offset) >> shift)
        };
        self.pool.release_buffer(buf);
        Ok(status)
    }

    /// Record a transaction's status. Transitions that violate the
    /// monotonic status machine are rejected with a warning and leave the
    /// stored status unchanged.
    pub fn set_status(&self, xid: TransactionId, status: XidStatus) -> Result<()> {
        if xid < FIRST_TRANSACTION_ID {
            return Err(StoreError::Internal(format!(
                "status write for invalid transaction id {xid}"
            )));
        }
        let block = match self.block_for(xid) {
            Some(block) => block,
            None => {
                warn!(xid, "status write below the log low-water mark");
                return Ok(());
            }
        };
        if block > MAX_LOG_BLOCK {
            return Err(StoreError::LogBlockOutOfRange(block));
        }
        self.ensure_block(block)?;

        let buf = self.pool.read_buffer(&self.rel, block, false)?;
        let (offset, shift) = self.word_position(xid);
        {
            let _spin = self.xid_set_lock.lock();
            let word = Self::read_word(&buf, offset);
            let old = XidStatus::from_bits(word >> shift);
            if !old.may_become(status) {
                warn!(
                    xid,
                    from = ?old,
                    to = ?status,
                    "rejecting invalid transaction status transition"
                );
                drop(_spin);
                self.pool.release_buffer(buf);
                return Ok(());
            }
            let bits = (status as u64) << shift;
            let updated = if status == XidStatus::SoftCommit {
                // Soft commit only ever sets bits, so a concurrent commit
                // upgrade is never torn down.
                word | bits
            } else {
                (word & !(0b11 << shift)) | bits
            };
            Self::write_word(&buf, offset, updated);
        }

        if self.multiuser {
            self.pool.write_buffer(buf);
            Ok(())
        } else {
            self.pool.flush_buffer(buf)
        }
    }

    /// Force the log relation's dirty pages to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_rel_buffers(self.rel.node())
    }

    pub fn did_commit(&self, xid: TransactionId) -> Result<bool> {
        Ok(self.status_of(xid)?.is_committed())
    }

    pub fn did_abort(&self, xid: TransactionId) -> Result<bool> {
        Ok(self.status_of(xid)? == XidStatus::Aborted)
    }

    pub fn is_in_progress(&self, xid: TransactionId) -> Result<bool> {
        Ok(self.status_of(xid)? == XidStatus::InProgress)
    }

    /// Raise the low-water mark and drop the leading log blocks every id
    /// below it occupied. Callers serialize vacuums through the master
    /// write lock; ids below the new mark read as committed afterwards.
    pub fn vacuum_log(&self, new_low_water: TransactionId) -> Result<()> {
        let old = self.low_water_mark();
        if new_low_water <= old {
            return Ok(());
        }
        let per = self.statuses_per_block;
        let drop_blocks = (new_low_water / per - old / per) as BlockNumber;

        if drop_blocks > 0 {
            let node = self.rel.node();
            self.pool.flush_rel_buffers(node)?;
            self.pool.drop_rel_buffers(node);

            let total = self.smgr.nblocks(node)?;
            if drop_blocks < total {
                for blk in drop_blocks..total {
                    let read = self.smgr.read(node, blk)?;
                    let mut page = read.page;
                    self.smgr.write(node, blk - drop_blocks, &mut page)?;
                }
                self.smgr.truncate(node, total - drop_blocks)?;
            } else {
                self.smgr.truncate(node, 0)?;
            }
        }

        self.low_water.store(new_low_water, Ordering::SeqCst);
        self.write_control(ControlData {
            version: LOG_SYSTEM_VERSION,
            next_xid: self.xid_fence.load(Ordering::SeqCst),
            low_water: new_low_water,
        })
    }
}
