// Buffer pool: descriptors, free lists, and the replacement engine.

pub mod descriptor;
pub mod freelist;
pub mod pool;

pub use descriptor::{
    BufferDesc, BufferId, BufferLockMode, BufferTag, BM_DIRTY, BM_ERROR, BM_EXCLUSIVE, BM_FREE,
    BM_READONLY, BM_RETIRED, BM_USED, BM_VALID,
};
pub use pool::{BufferPool, BufferRef};
