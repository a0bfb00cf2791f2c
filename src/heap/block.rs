//! The block header stored in front of every payload.
//!
//! A header occupies 16 bytes and is stored in little-endian byte order, so
//! that the host can inspect the heap directly:
//! ```text
//! +--------+--------+--------+--------+---------------- ...
//! | size   | next   | free   | "BLOK" | payload (size bytes)
//! +--------+--------+--------+--------+---------------- ...
//! 0        4        8        12       16
//! ```
//! `next` is the address of the following header or [`NO_BLOCK`] for the
//! last block. `free` is either `0` (used) or `1` (free), every other value
//! is treated as corruption. The tag never changes while the header is part
//! of the block list and is erased when the header is merged away.
use crate::memory::{read_u32, region, region_mut, write_u32};

/// The size of a block header in bytes.
pub const HEADER_SIZE: u32 = 16;

/// The signature in the last four bytes of every header.
pub const TAG: [u8; 4] = *b"BLOK";

/// The `next`-value of the last block.
pub const NO_BLOCK: u32 = u32::MAX;

const SIZE: u32 = 0;
const NEXT: u32 = 4;
const FREE: u32 = 8;
const TAG_OFFSET: u32 = 12;

/// A decoded block header together with its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// The address of the header.
    pub address: u32,
    /// The usable payload size in bytes (excluding the header).
    pub size: u32,
    /// The address of the next header, if any.
    pub next: Option<u32>,
    /// Whether the block is available for allocation.
    pub free: bool,
}
impl Block {
    /// A free block at `address`.
    pub const fn free(address: u32, size: u32, next: Option<u32>) -> Self {
        Self {
            address,
            size,
            next,
            free: true,
        }
    }

    /// A used block at `address`.
    pub const fn used(address: u32, size: u32, next: Option<u32>) -> Self {
        Self {
            address,
            size,
            next,
            free: false,
        }
    }

    /// The address of the payload, the pointer handed out to callers.
    pub const fn payload(&self) -> u32 {
        self.address + HEADER_SIZE
    }

    /// The address of the first byte behind the payload.
    ///
    /// For every block but the last this is the address of the next header.
    pub const fn end(&self) -> u32 {
        self.address + HEADER_SIZE + self.size
    }
}

/// Why a header could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderFault {
    /// The header is not completely inside the memory.
    OutOfBounds,
    /// The tag does not match [`TAG`].
    BadTag,
    /// The free-flag is neither `0` nor `1`.
    BadFlag,
}

/// Check only the tag of the header at `address`.
pub(crate) fn has_tag(memory: &[u8], address: u32) -> bool {
    address
        .checked_add(TAG_OFFSET)
        .and_then(|offset| region(memory, offset, 4))
        .map_or(false, |tag| tag == TAG)
}

/// Decode the header at `address`.
///
/// The tag is only verified if `verify_tag` is set.
pub(crate) fn load(memory: &[u8], address: u32, verify_tag: bool) -> Result<Block, HeaderFault> {
    let bytes = region(memory, address, HEADER_SIZE).ok_or(HeaderFault::OutOfBounds)?;
    if verify_tag && bytes[TAG_OFFSET as usize..] != TAG {
        return Err(HeaderFault::BadTag);
    }
    let size = read_u32(bytes, SIZE).ok_or(HeaderFault::OutOfBounds)?;
    let next = read_u32(bytes, NEXT).ok_or(HeaderFault::OutOfBounds)?;
    let free = match read_u32(bytes, FREE).ok_or(HeaderFault::OutOfBounds)? {
        0 => false,
        1 => true,
        _ => return Err(HeaderFault::BadFlag),
    };
    Ok(Block {
        address,
        size,
        next: (next != NO_BLOCK).then_some(next),
        free,
    })
}

/// Encode `block` at its address, including the tag.
pub(crate) fn store(memory: &mut [u8], block: &Block) -> Result<(), HeaderFault> {
    let bytes = region_mut(memory, block.address, HEADER_SIZE).ok_or(HeaderFault::OutOfBounds)?;
    write_u32(bytes, SIZE, block.size).ok_or(HeaderFault::OutOfBounds)?;
    write_u32(bytes, NEXT, block.next.unwrap_or(NO_BLOCK)).ok_or(HeaderFault::OutOfBounds)?;
    write_u32(bytes, FREE, u32::from(block.free)).ok_or(HeaderFault::OutOfBounds)?;
    bytes[TAG_OFFSET as usize..].copy_from_slice(&TAG);
    Ok(())
}

/// Erase the tag of a header, which is no longer part of the block list.
pub(crate) fn erase(memory: &mut [u8], address: u32) {
    if let Some(tag) = address
        .checked_add(TAG_OFFSET)
        .and_then(|offset| region_mut(memory, offset, 4))
    {
        tag.fill(0);
    }
}
