// Heap page I/O: tuple placement and retrieval.
//
// Placement trusts the free-space directory only as a hint: the real free
// space is re-checked under the exclusive page lock, and stale directory
// entries are corrected before retrying. Oversize tuples are spanned into
// segment tuples when the relation carries a blob attribute, with a
// synthesized header tuple pointing at the chain; otherwise they are
// rejected outright without touching a page.

use std::sync::Arc;

use tracing::{error, warn};

use crate::buffer::{BufferLockMode, BufferPool, BufferRef, BM_EXCLUSIVE};
use crate::catalog::Relation;
use crate::common::{max_align, BlockNumber, RelKind, TupleId};
use crate::error::{Result, StoreError};
use crate::heap::visibility::{Snapshot, UpdateStatus, VisibilityOracle};
use crate::heap::{
    BlobRef, FreeSpaceDirectory, HeapTuple, TUPLE_BLOB_HEAD, TUPLE_BLOB_SEGMENT,
    TUPLE_HAS_BUFFERED, TUPLE_HEADER_SIZE, TUPLE_READONLY,
};
use crate::lock::LockManager;
use crate::storage::page::{max_tuple_size, Page};

pub struct Heap {
    pool: Arc<BufferPool>,
    freespace: Arc<FreeSpaceDirectory>,
    locks: Arc<LockManager>,
    oracle: Arc<dyn VisibilityOracle>,
    page_size: usize,
}

impl Heap {
    pub fn new(
        pool: Arc<BufferPool>,
        freespace: Arc<FreeSpaceDirectory>,
        locks: Arc<LockManager>,
        oracle: Arc<dyn VisibilityOracle>,
        page_size: usize,
    ) -> Self {
        Self {
            pool,
            freespace,
            locks,
            oracle,
            page_size,
        }
    }

    /// Largest aligned tuple image that fits on an empty heap page.
    pub fn max_tuple_size(&self) -> usize {
        max_tuple_size(self.page_size) & !7
    }

    fn segment_capacity(&self) -> usize {
        (self.max_tuple_size() - TUPLE_HEADER_SIZE) & !7
    }

    /// Place a tuple on a page with enough free space at or after
    /// `limit_block`, spanning oversize payloads into blob segments when
    /// the relation supports them. Returns the block that took the tuple.
    pub fn put_tuple(
        &self,
        rel: &Relation,
        tuple: &mut HeapTuple,
        limit_block: BlockNumber,
    ) -> Result<BlockNumber> {
        let mut limit = limit_block;

        if tuple.has_flag(TUPLE_HAS_BUFFERED) {
            limit = self.span_buffered(rel, tuple)?;
        }

        let mut len = max_align(tuple.stored_len());
        if len > self.max_tuple_size() {
            if rel.has_blob_attr {
                // The header tuple must follow the segments already stored.
                limit = self.store_tuple_blob(rel, tuple)?;
                len = max_align(tuple.stored_len());
            } else {
                return Err(StoreError::TupleTooBig {
                    size: len,
                    max: self.max_tuple_size(),
                });
            }
        }

        loop {
            let blk = self.freespace.get_freespace(rel, &self.pool, len, limit)?;
            let buf = self.pool.read_buffer(rel, blk, true)?;

            self.pool.lock_buffer(&buf, BufferLockMode::Exclusive);
            let usable = if buf.has_error() {
                // Never place data on a page that failed its checksum.
                0
            } else {
                buf.with_page_mut(|p| {
                    if p.is_new() {
                        p.init(0);
                    }
                    p.free_space()
                })
            };

            // The directory is advisory; re-check under the lock.
            if usable < len {
                self.pool.lock_buffer(&buf, BufferLockMode::Unlock);
                self.pool.release_buffer(buf);
                self.freespace.deactivate_freespace(rel, blk, usable);
                continue;
            }

            let offnum = buf.with_page_mut(|p| Self::add_tuple_to_page(p, tuple, blk))?;
            self.pool.lock_buffer(&buf, BufferLockMode::Unlock);

            let remaining = buf.with_page(|p| p.free_space());
            self.freespace.note_freespace(rel, blk, remaining);
            self.pool.write_buffer(buf);

            debug_assert_eq!(tuple.self_tid, TupleId::new(blk, offnum));
            return Ok(blk);
        }
    }

    /// Add a tuple to a page the caller already holds exclusively locked;
    /// used for sequence pages and other single-page internal relations.
    pub fn put_tuple_at(&self, buf: &BufferRef, tuple: &mut HeapTuple) -> Result<()> {
        debug_assert!(
            buf.desc.state.lock().flag(BM_EXCLUSIVE),
            "caller must hold the exclusive page lock"
        );
        let blk = buf.block();
        buf.with_page_mut(|p| {
            if p.is_new() {
                p.init(0);
            }
            if p.free_space() < max_align(tuple.stored_len()) {
                return Err(StoreError::Internal(format!(
                    "page {blk} has no room for a {} byte tuple",
                    tuple.stored_len()
                )));
            }
            Self::add_tuple_to_page(p, tuple, blk).map(|_| ())
        })
    }

    fn add_tuple_to_page(
        page: &mut Page,
        tuple: &mut HeapTuple,
        blk: BlockNumber,
    ) -> Result<crate::common::OffsetNumber> {
        let image = tuple.serialize();
        let offnum = page
            .add_item(&image)
            .ok_or_else(|| StoreError::Internal("page rejected a tuple that fit".into()))?;
        let tid = TupleId::new(blk, offnum);
        tuple.self_tid = tid;
        // Stamp the stored image with its own location.
        if let Some(range) = page_item_range(page, offnum) {
            HeapTuple::write_tid(&mut page.as_bytes_mut()[range], tid);
        }
        Ok(offnum)
    }

    /// Split an oversize payload into segment tuples and replace the
    /// payload with a reference to the chain. Returns the last segment's
    /// block so the header tuple is placed after it.
    fn store_tuple_blob(&self, rel: &Relation, tuple: &mut HeapTuple) -> Result<BlockNumber> {
        let capacity = self.segment_capacity();
        let data = std::mem::take(&mut tuple.data);
        let total_len = data.len() as u64;

        let mut first = TupleId::INVALID;
        let mut segments = 0u32;
        let mut limit = 0;
        for chunk in data.chunks(capacity) {
            let mut seg = HeapTuple::with_insert(chunk.to_vec(), tuple.xmin, tuple.cmin);
            seg.info |= TUPLE_BLOB_SEGMENT;
            limit = self.put_tuple(rel, &mut seg, limit)?;
            if segments == 0 {
                first = seg.self_tid;
            }
            segments += 1;
        }

        tuple.data = BlobRef {
            first,
            total_len,
            segments,
        }
        .encode();
        tuple.info &= !TUPLE_HAS_BUFFERED;
        tuple.info |= TUPLE_BLOB_HEAD;
        Ok(limit)
    }

    /// Re-span a payload that arrived through a buffered source. The
    /// segments land first and the synthesized header follows them.
    fn span_buffered(&self, rel: &Relation, tuple: &mut HeapTuple) -> Result<BlockNumber> {
        if !rel.has_blob_attr {
            return Err(StoreError::TupleTooBig {
                size: max_align(tuple.stored_len()),
                max: self.max_tuple_size(),
            });
        }
        self.store_tuple_blob(rel, tuple)
    }

    /// Fetch the tuple a TID names, filling the caller's tuple from the
    /// page image. Returns the pinned buffer, or `None` when the item id
    /// is no longer used.
    pub fn get_tuple(&self, rel: &Relation, tuple: &mut HeapTuple) -> Result<Option<BufferRef>> {
        self.get_tuple_with_buffer(rel, tuple, None)
    }

    /// Like `get_tuple`, but reuses an already-pinned buffer when it covers
    /// the target block. Read-only callers get a thread-private buffer that
    /// bypasses the shared pool.
    pub fn get_tuple_with_buffer(
        &self,
        rel: &Relation,
        tuple: &mut HeapTuple,
        inbuf: Option<BufferRef>,
    ) -> Result<Option<BufferRef>> {
        let tid = tuple.self_tid;
        if !tid.is_valid() {
            if let Some(buf) = inbuf {
                self.pool.release_buffer(buf);
            }
            return Err(StoreError::InvalidItemId {
                block: tid.block,
                offset: tid.offset,
            });
        }

        let readonly = rel.kind == RelKind::Regular && tuple.has_flag(TUPLE_READONLY);
        let buf = if readonly {
            if let Some(buf) = inbuf {
                self.pool.release_buffer(buf);
            }
            self.pool.read_buffer_readonly(rel, tid.block)?
        } else if let Some(buf) = inbuf {
            self.pool.release_and_read_buffer(buf, rel, tid.block)?
        } else {
            self.pool.read_buffer(rel, tid.block, false)?
        };

        if buf.has_error() {
            let relation = rel.oid;
            self.pool.release_buffer(buf);
            return Err(StoreError::BadBuffer {
                relation,
                block: tid.block,
            });
        }

        self.pool.lock_buffer(&buf, BufferLockMode::Share);
        let image = buf.with_page(|p| {
            if !p.is_valid() {
                return None;
            }
            p.item(tid.offset).map(|item| item.to_vec())
        });
        self.pool.lock_buffer(&buf, BufferLockMode::Unlock);

        match image {
            Some(image) => {
                let flags = tuple.info & TUPLE_READONLY;
                *tuple = HeapTuple::deserialize(&image)?;
                tuple.info |= flags;
                Ok(Some(buf))
            }
            None => {
                self.pool.release_buffer(buf);
                Ok(None)
            }
        }
    }

    /// Reassemble the payload of a spanned tuple from its segment chain.
    pub fn read_blob(&self, rel: &Relation, head: &HeapTuple) -> Result<Vec<u8>> {
        if !head.has_flag(TUPLE_BLOB_HEAD) {
            return Ok(head.data.clone());
        }
        let blob = BlobRef::decode(&head.data)?;
        let mut out = Vec::with_capacity(blob.total_len as usize);
        for k in 0..blob.segments {
            // A segment fills a page on its own, so the chain occupies
            // consecutive blocks starting at the first segment's.
            let mut seg = HeapTuple::new(Vec::new());
            seg.self_tid = TupleId::new(blob.first.block + k, blob.first.offset);
            let buf = self.get_tuple(rel, &mut seg)?.ok_or_else(|| {
                StoreError::Internal("blob segment chain is broken".into())
            })?;
            self.pool.release_buffer(buf);
            if !seg.has_flag(TUPLE_BLOB_SEGMENT) {
                return Err(StoreError::Internal(
                    "blob chain crossed into a non-segment tuple".into(),
                ));
            }
            out.extend_from_slice(&seg.data);
        }
        if out.len() as u64 != blob.total_len {
            warn!(
                expected = blob.total_len,
                actual = out.len(),
                "blob length mismatch on reassembly"
            );
        }
        Ok(out)
    }

    /// Lock the page under a fetched tuple.
    pub fn lock_tuple(&self, buf: &BufferRef, mode: BufferLockMode) {
        self.pool.lock_buffer(buf, mode);
    }

    pub fn unlock_tuple(&self, buf: &BufferRef) {
        self.pool.lock_buffer(buf, BufferLockMode::Unlock);
    }

    /// Lock a tuple for update: pin and exclusively lock its page, ask the
    /// visibility oracle, and wait out an in-progress writer unless the
    /// snapshot requests nowait. On `MayBeUpdated` (and the terminal
    /// update/delete statuses) the buffer is returned still locked.
    pub fn lock_tuple_for_update(
        &self,
        rel: &Relation,
        tuple: &mut HeapTuple,
        snapshot: &Snapshot,
    ) -> Result<(UpdateStatus, Option<BufferRef>)> {
        let nowait = snapshot.is_nowait();
        loop {
            let buf = match self.get_tuple(rel, tuple)? {
                Some(buf) => buf,
                None => {
                    warn!(tid = %tuple.self_tid, "tuple vanished before update lock");
                    return Ok((UpdateStatus::Invisible, None));
                }
            };
            self.pool.lock_buffer(&buf, BufferLockMode::Exclusive);

            let status = self.oracle.satisfies_update(tuple, snapshot)?;
            match status {
                UpdateStatus::MayBeUpdated => return Ok((status, Some(buf))),
                UpdateStatus::Invisible => {
                    // An invisible tuple reached an update path: structural
                    // damage or a snapshot bug. Report and bail out.
                    error!(
                        relation = rel.oid,
                        tid = %tuple.self_tid,
                        "attempted to lock an invisible tuple for update"
                    );
                    self.unlock_tuple(&buf);
                    self.pool.release_buffer(buf);
                    return Ok((status, None));
                }
                UpdateStatus::BeingUpdated => {
                    let xwait = tuple.xmax;
                    if nowait {
                        self.unlock_tuple(&buf);
                        self.pool.release_buffer(buf);
                        return Ok((status, None));
                    }
                    self.unlock_tuple(&buf);
                    self.pool.release_buffer(buf);
                    self.locks.xact_lock_wait(xwait, snapshot.xid)?;
                    // Re-fetch and re-judge the tuple.
                }
                UpdateStatus::Updated | UpdateStatus::SelfUpdated | UpdateStatus::Deleted => {
                    return Ok((status, Some(buf)));
                }
            }
        }
    }
}

/// Byte range of a used item inside the page image.
fn page_item_range(
    page: &Page,
    offnum: crate::common::OffsetNumber,
) -> Option<std::ops::Range<usize>> {
    let id = page.item_id(offnum)?;
    if !id.is_used() {
        return None;
    }
    let start = id.offset as usize;
    Some(start..start + id.length as usize)
}
