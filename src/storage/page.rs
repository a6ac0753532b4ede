// Fixed-size page layout.
//
// A page is a byte buffer with a small header, a downward-growing item
// directory, an upward-growing free-space hole, and an optional "special"
// area reserved at the tail for access-method private data:
//
// ```text
// +----------------+---------------------+--------------+---------+---------+
// | header (16 B)  | item ids (6 B each) |  free space  | tuples  | special |
// +----------------+---------------------+--------------+---------+---------+
//                  ^ grows right                          grows left ^
// ```
//
// Item directory slots are one-based. A slot records the tuple's byte
// offset, its length, and a used flag; unused slots may be recycled by a
// later insertion.

use std::ops::Range;

use crate::common::{max_align, OffsetNumber, FIRST_OFFSET, INVALID_OFFSET};
use crate::storage::checksum::page_checksum;

/// Current page layout version, stored in every page header.
pub const PAGE_LAYOUT_VERSION: u16 = 4;

/// Byte size of the page header.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Byte size of one item directory entry.
pub const ITEM_ID_SIZE: usize = 6;

/// Location of the stored checksum within the header.
pub const CHECKSUM_RANGE: Range<usize> = 8..12;

// Header field offsets.
const OFF_VERSION: usize = 0;
const OFF_LOWER: usize = 2;
const OFF_UPPER: usize = 4;
const OFF_SPECIAL: usize = 6;
const OFF_CHECKSUM: usize = 8;
const OFF_FLAGS: usize = 12;

// Item id flag values.
const LP_UNUSED: u16 = 0;
const LP_USED: u16 = 1;

/// One decoded item directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    pub offset: u16,
    pub length: u16,
    pub flags: u16,
}

impl ItemId {
    pub fn is_used(&self) -> bool {
        self.flags == LP_USED
    }
}

/// An in-memory page image.
#[derive(Clone)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    /// Allocate a zeroed (new) page of the given size.
    pub fn new(page_size: usize) -> Self {
        Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn set_u16(&mut self, off: usize, val: u16) {
        self.data[off..off + 2].copy_from_slice(&val.to_le_bytes());
    }

    /// Format the page: write the header and set up the free-space bounds,
    /// reserving `special_size` bytes at the tail.
    pub fn init(&mut self, special_size: usize) {
        let size = self.data.len();
        let special = size - max_align(special_size);
        self.data.fill(0);
        self.set_u16(OFF_VERSION, PAGE_LAYOUT_VERSION);
        self.set_u16(OFF_LOWER, PAGE_HEADER_SIZE as u16);
        self.set_u16(OFF_UPPER, special as u16);
        self.set_u16(OFF_SPECIAL, special as u16);
        self.set_u16(OFF_FLAGS, 0);
    }

    /// A page of all zero bytes has never been formatted or written.
    pub fn is_new(&self) -> bool {
        self.get_u16(OFF_UPPER) == 0
    }

    /// Sanity-check the header bounds.
    pub fn is_valid(&self) -> bool {
        let (lower, upper, special) = (self.lower(), self.upper(), self.special());
        !self.is_new()
            && lower >= PAGE_HEADER_SIZE
            && lower <= upper
            && upper <= special
            && special <= self.data.len()
    }

    pub fn lower(&self) -> usize {
        self.get_u16(OFF_LOWER) as usize
    }

    pub fn upper(&self) -> usize {
        self.get_u16(OFF_UPPER) as usize
    }

    pub fn special(&self) -> usize {
        self.get_u16(OFF_SPECIAL) as usize
    }

    /// Bytes of the special area at the page tail.
    pub fn special_area(&self) -> &[u8] {
        &self.data[self.special()..]
    }

    pub fn special_area_mut(&mut self) -> &mut [u8] {
        let special = self.special();
        &mut self.data[special..]
    }

    /// Number of item directory slots, used or not.
    pub fn max_offset(&self) -> OffsetNumber {
        let lower = self.lower();
        if lower <= PAGE_HEADER_SIZE {
            return 0;
        }
        ((lower - PAGE_HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
    }

    /// Free space available for one more tuple, accounting for the item id
    /// the insertion would consume.
    pub fn free_space(&self) -> usize {
        let hole = self.upper().saturating_sub(self.lower());
        hole.saturating_sub(ITEM_ID_SIZE)
    }

    fn item_id_pos(offnum: OffsetNumber) -> usize {
        PAGE_HEADER_SIZE + (offnum as usize - 1) * ITEM_ID_SIZE
    }

    /// Decode the item id at a one-based slot number.
    pub fn item_id(&self, offnum: OffsetNumber) -> Option<ItemId> {
        if offnum == INVALID_OFFSET || offnum > self.max_offset() {
            return None;
        }
        let pos = Self::item_id_pos(offnum);
        Some(ItemId {
            offset: self.get_u16(pos),
            length: self.get_u16(pos + 2),
            flags: self.get_u16(pos + 4),
        })
    }

    fn set_item_id(&mut self, offnum: OffsetNumber, id: ItemId) {
        let pos = Self::item_id_pos(offnum);
        self.set_u16(pos, id.offset);
        self.set_u16(pos + 2, id.length);
        self.set_u16(pos + 4, id.flags);
    }

    /// Bytes of the tuple stored at a used slot.
    pub fn item(&self, offnum: OffsetNumber) -> Option<&[u8]> {
        let id = self.item_id(offnum)?;
        if !id.is_used() {
            return None;
        }
        let start = id.offset as usize;
        Some(&self.data[start..start + id.length as usize])
    }

    /// Add a tuple to the page, recycling an unused directory slot when one
    /// exists. Returns the slot number, or `None` when the tuple does not
    /// fit.
    pub fn add_item(&mut self, item: &[u8]) -> Option<OffsetNumber> {
        let aligned = max_align(item.len());
        let mut offnum = INVALID_OFFSET;
        let mut extend = true;
        for slot in FIRST_OFFSET..=self.max_offset() {
            if let Some(id) = self.item_id(slot) {
                if !id.is_used() {
                    offnum = slot;
                    extend = false;
                    break;
                }
            }
        }

        let lower = self.lower();
        let upper = self.upper();
        let needed = aligned + if extend { ITEM_ID_SIZE } else { 0 };
        if upper.saturating_sub(lower) < needed {
            return None;
        }

        if extend {
            offnum = self.max_offset() + 1;
            self.set_u16(OFF_LOWER, (lower + ITEM_ID_SIZE) as u16);
        }
        let start = upper - aligned;
        self.data[start..start + item.len()].copy_from_slice(item);
        self.set_item_id(
            offnum,
            ItemId {
                offset: start as u16,
                length: item.len() as u16,
                flags: LP_USED,
            },
        );
        self.set_u16(OFF_UPPER, start as u16);
        Some(offnum)
    }

    /// Mark a slot unused. The tuple bytes are not reclaimed until the page
    /// is compacted by a maintenance pass.
    pub fn delete_item(&mut self, offnum: OffsetNumber) -> bool {
        match self.item_id(offnum) {
            Some(mut id) if id.is_used() => {
                id.flags = LP_UNUSED;
                self.set_item_id(offnum, id);
                true
            }
            _ => false,
        }
    }

    /// Recompute and store the checksum. Call before handing the page to
    /// the storage manager.
    pub fn set_checksum(&mut self) {
        let sum = page_checksum(&self.data);
        self.data[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&sum.to_le_bytes());
    }

    /// Verify the stored checksum. New (all-zero) pages verify trivially.
    pub fn verify_checksum(&self) -> bool {
        if self.data.iter().all(|&b| b == 0) {
            return true;
        }
        let stored = u32::from_le_bytes([
            self.data[OFF_CHECKSUM],
            self.data[OFF_CHECKSUM + 1],
            self.data[OFF_CHECKSUM + 2],
            self.data[OFF_CHECKSUM + 3],
        ]);
        stored == page_checksum(&self.data)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .field("items", &self.max_offset())
            .finish()
    }
}

/// Largest tuple that fits on an empty page with no special area.
pub const fn max_tuple_size(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - ITEM_ID_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_bounds() {
        let mut page = Page::new(8192);
        assert!(page.is_new());
        page.init(0);
        assert!(!page.is_new());
        assert!(page.is_valid());
        assert_eq!(page.lower(), PAGE_HEADER_SIZE);
        assert_eq!(page.upper(), 8192);
        assert_eq!(page.max_offset(), 0);
    }

    #[test]
    fn test_add_and_get_items() {
        let mut page = Page::new(8192);
        page.init(0);
        let a = page.add_item(b"first tuple").unwrap();
        let b = page.add_item(b"second").unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(page.item(a).unwrap(), b"first tuple");
        assert_eq!(page.item(b).unwrap(), b"second");
        assert_eq!(page.max_offset(), 2);
    }

    #[test]
    fn test_add_item_fills_page() {
        let mut page = Page::new(512);
        page.init(0);
        let tuple = [7u8; 64];
        let mut count = 0;
        while page.add_item(&tuple).is_some() {
            count += 1;
        }
        // 512 - 16 header = 496; each insert costs 64 + 6.
        assert_eq!(count, 7);
        assert!(page.free_space() < max_align(tuple.len()));
    }

    #[test]
    fn test_delete_recycles_slot() {
        let mut page = Page::new(1024);
        page.init(0);
        let a = page.add_item(b"victim").unwrap();
        assert!(page.delete_item(a));
        assert!(page.item(a).is_none());
        let b = page.add_item(b"replacement").unwrap();
        assert_eq!(a, b);
        assert_eq!(page.item(b).unwrap(), b"replacement");
    }

    #[test]
    fn test_special_area() {
        let mut page = Page::new(8192);
        page.init(24);
        assert_eq!(page.special_area().len(), 24);
        page.special_area_mut()[0] = 0xfe;
        assert_eq!(page.special_area()[0], 0xfe);
        // The special area is excluded from tuple space.
        assert_eq!(page.upper(), 8192 - 24);
    }

    #[test]
    fn test_checksum_round_trip() {
        let mut page = Page::new(8192);
        page.init(0);
        page.add_item(b"content").unwrap();
        page.set_checksum();
        assert!(page.verify_checksum());
        page.as_bytes_mut()[100] ^= 0xff;
        assert!(!page.verify_checksum());
    }

    #[test]
    fn test_zero_page_verifies() {
        let page = Page::new(8192);
        assert!(page.verify_checksum());
    }
}
