// Page store: fixed-size page layout, checksums, and the file-per-relation
// storage manager.

pub mod checksum;
pub mod page;
pub mod smgr;

pub use page::{max_tuple_size, ItemId, Page, PAGE_HEADER_SIZE};
pub use smgr::{FileStorage, PageRead, RelFileNode};
