//! The block-structured heap allocator.
//!
//! The heap manages a single arena `[start, end)` inside the module memory
//! as an address-ordered, singly-linked list of [blocks](Block). Every block
//! consists of a [header](block) and a payload directly behind it. The list
//! always covers the whole arena without gaps: the header of the next block
//! starts at the first byte behind the payload of the previous one.
//!
//! The allocator does not own the memory. Every operation gets the whole
//! address space as a byte slice and addresses blocks by `u32` offsets into
//! it, so all header accesses are bounds-checked and no `unsafe` is needed.
//!
//! # Algorithm
//! Allocation is first-fit: the list is scanned from the start of the arena
//! and the first free block, that is large enough, is used. If the rest of
//! that block could hold another header plus the minimum payload, the block
//! is split into a used block of the requested size (rounded up to the
//! alignment) and a new free block behind it. Otherwise the whole, possibly oversized, block is handed
//! out.
//!
//! Freeing scans the list from the start as well. This validates, that the
//! pointer really is the payload of a block, and yields the predecessor of
//! the freed block on the way. The block is then merged with a free
//! successor and afterwards into a free predecessor, so there are never two
//! adjacent free blocks.
//!
//! Both operations are `O(n)` in the number of blocks.
use crate::error::{ConfigError, HeapError, PointerFault};
use crate::memory::align_up;
use core::cell::Cell;
use core::ops::Range;

mod block;
pub use block::{Block, HEADER_SIZE, NO_BLOCK, TAG};
use block::HeaderFault;

/// The tunables of the [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    alignment: u32,
    min_payload: u32,
    verify_tags: bool,
}
impl HeapConfig {
    /// The default payload alignment.
    pub const DEFAULT_ALIGNMENT: u32 = 4;
    /// The default minimum payload of a block.
    pub const DEFAULT_MIN_PAYLOAD: u32 = 4;

    /// The default configuration: 4-byte alignment, a minimum payload of 4
    /// bytes and verified header tags.
    pub const fn new() -> Self {
        Self {
            alignment: Self::DEFAULT_ALIGNMENT,
            min_payload: Self::DEFAULT_MIN_PAYLOAD,
            verify_tags: true,
        }
    }

    /// Set the payload alignment. It has to be a power of two between 1 and
    /// 16 (the header size has to be a multiple of it).
    pub const fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the smallest payload a free block may be split into.
    pub const fn with_min_payload(mut self, min_payload: u32) -> Self {
        self.min_payload = min_payload;
        self
    }

    /// Enable or disable the header tag check.
    ///
    /// Disabling it saves a few comparisons per visited block. Pointers are
    /// still validated by walking the block list, but silent corruption of
    /// a header tag goes unnoticed.
    pub const fn with_tag_verification(mut self, verify_tags: bool) -> Self {
        self.verify_tags = verify_tags;
        self
    }

    pub const fn alignment(&self) -> u32 {
        self.alignment
    }

    pub const fn min_payload(&self) -> u32 {
        self.min_payload
    }

    pub const fn verify_tags(&self) -> bool {
        self.verify_tags
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.alignment.is_power_of_two() || self.alignment > HEADER_SIZE {
            return Err(ConfigError::InvalidAlignment(self.alignment));
        }
        if self.min_payload == 0 || self.min_payload > u32::MAX - HEADER_SIZE {
            return Err(ConfigError::InvalidMinPayload);
        }
        Ok(())
    }

    /// The number of payload bytes reserved for a request of `size` bytes.
    fn effective_size(&self, size: u32) -> Option<u32> {
        align_up(size.max(self.min_payload), self.alignment)
    }
}
impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A summary of the heap, as computed by [`Heap::check()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub used_blocks: u32,
    pub free_blocks: u32,
    /// Payload bytes of all used blocks (including alignment padding).
    pub used_bytes: u32,
    /// Payload bytes of all free blocks.
    pub free_bytes: u32,
    /// The largest request, that would currently succeed.
    pub largest_free: u32,
}
impl HeapStats {
    /// The total number of blocks.
    pub const fn blocks(&self) -> u32 {
        self.used_blocks + self.free_blocks
    }
}

/// The heap allocator over one arena.
#[derive(Debug, Clone)]
pub struct Heap {
    start: u32,
    end: u32,
    config: HeapConfig,
    /// The address where corruption was first detected.
    corrupted: Cell<Option<u32>>,
}
impl Heap {
    /// Set up the heap over `arena` inside `memory`.
    ///
    /// This writes a single free block spanning the whole arena. Any block
    /// list, that was present in the arena before, is discarded.
    ///
    /// # Errors
    /// The arena has to be inside the memory, aligned to the configured
    /// alignment and large enough for a header plus the minimum payload.
    pub fn initialize(
        memory: &mut [u8],
        arena: Range<u32>,
        config: HeapConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let Range { start, end } = arena;
        if start > end {
            return Err(ConfigError::InvertedRegion { start, end });
        }
        if end as usize > memory.len() {
            return Err(ConfigError::RegionOutOfBounds { start, end });
        }
        if start % config.alignment != 0 {
            return Err(ConfigError::MisalignedArena {
                start,
                alignment: config.alignment,
            });
        }
        let size = end - start;
        let required = HEADER_SIZE + config.min_payload;
        if size < required {
            return Err(ConfigError::ArenaTooSmall { size, required });
        }

        let initial = Block::free(start, size - HEADER_SIZE, None);
        block::store(memory, &initial).map_err(|_| ConfigError::RegionOutOfBounds { start, end })?;
        log::debug!(
            "heap initialized over {start:#x}..{end:#x} ({} bytes usable)",
            initial.size
        );

        Ok(Self {
            start,
            end,
            config,
            corrupted: Cell::new(None),
        })
    }

    /// The arena managed by this heap.
    pub const fn arena(&self) -> Range<u32> {
        self.start..self.end
    }

    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The address of the first detected corruption, if any.
    ///
    /// A corrupted heap refuses every further request.
    pub fn corrupted_at(&self) -> Option<u32> {
        self.corrupted.get()
    }

    /// Allocate a block with at least `size` usable bytes.
    ///
    /// Returns the address of the payload. The block may be larger than
    /// requested: requests are rounded up to the minimum payload and the
    /// alignment, and a block is not split if the remainder would be too
    /// small to be useful.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no free block is large enough. The heap
    /// is not modified in that case.
    pub fn allocate(&mut self, memory: &mut [u8], size: u32) -> Result<u32, HeapError> {
        self.intact()?;
        let out_of_memory = || {
            log::warn!("out of memory: no free block for {size} bytes");
            HeapError::OutOfMemory { requested: size }
        };
        let needed = size.max(self.config.min_payload);

        let mut found = None;
        for block in self.blocks(memory) {
            let block = block?;
            if block.free && block.size >= needed {
                found = Some(block);
                break;
            }
        }
        let found = found.ok_or_else(out_of_memory)?;

        let mut used = Block::used(found.address, found.size, found.next);
        // the split point is aligned, the rest has to hold a header plus the
        // minimum payload
        let split = self.config.effective_size(size).filter(|&wanted| {
            wanted
                .checked_add(HEADER_SIZE + self.config.min_payload)
                .map_or(false, |required| found.size >= required)
        });
        if let Some(wanted) = split {
            let rest = Block::free(
                found.payload() + wanted,
                found.size - wanted - HEADER_SIZE,
                found.next,
            );
            self.store(memory, &rest)?;
            used.size = wanted;
            used.next = Some(rest.address);
            log::trace!(
                "split block {:#x}: {} bytes used, {} bytes free at {:#x}",
                used.address,
                used.size,
                rest.size,
                rest.address
            );
        }
        self.store(memory, &used)?;

        log::trace!("allocate({size}) -> {:#x}", used.payload());
        Ok(used.payload())
    }

    /// Free the block with the payload at `address`.
    ///
    /// The block is merged with free neighbors on both sides.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] if `address` is not the payload of a
    /// used block. The heap is not modified in that case.
    pub fn free(&mut self, memory: &mut [u8], address: u32) -> Result<(), HeapError> {
        self.intact()?;
        let (previous, mut freed) = self.find(memory, address)?;
        if freed.free {
            return Err(self.invalid(address, PointerFault::NotAllocated));
        }
        freed.free = true;

        let mut absorbed = None;
        if let Some(next) = self.successor(memory, &freed)? {
            if next.free {
                freed.size += HEADER_SIZE + next.size;
                freed.next = next.next;
                absorbed = Some(next.address);
            }
        }

        match previous {
            Some(mut previous) if previous.free => {
                previous.size += HEADER_SIZE + freed.size;
                previous.next = freed.next;
                self.store(memory, &previous)?;
                block::erase(memory, freed.address);
                log::trace!(
                    "free({address:#x}): merged into {:#x} ({} bytes)",
                    previous.address,
                    previous.size
                );
            }
            _ => {
                self.store(memory, &freed)?;
                log::trace!("free({address:#x}): {} bytes free", freed.size);
            }
        }
        if let Some(absorbed) = absorbed {
            block::erase(memory, absorbed);
        }
        Ok(())
    }

    /// Recover the block of the payload at `address`.
    ///
    /// The same rules as for [`free()`](Self::free) apply, except that free
    /// blocks are reported as well.
    pub fn block_for(&self, memory: &[u8], address: u32) -> Result<Block, HeapError> {
        self.intact()?;
        self.find(memory, address).map(|(_, block)| block)
    }

    /// Iterate over all blocks in address order.
    ///
    /// The iterator stops after reporting the first error.
    pub fn blocks<'h, 'm>(&'h self, memory: &'m [u8]) -> Blocks<'h, 'm> {
        Blocks {
            heap: self,
            memory,
            state: State::Start,
        }
    }

    /// Verify the whole block list and summarize it.
    ///
    /// Besides the checks done on every walk (tags, flags, links, coverage
    /// of the arena) this makes sure, that no two free blocks are adjacent.
    pub fn check(&self, memory: &[u8]) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats::default();
        let mut previous_free = false;
        for block in self.blocks(memory) {
            let block = block?;
            if block.free {
                if previous_free {
                    return Err(self.corruption(block.address, "adjacent free blocks"));
                }
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            } else {
                stats.used_blocks += 1;
                stats.used_bytes += block.size;
            }
            previous_free = block.free;
        }
        Ok(stats)
    }

    /// Find the block of the payload `address` and its predecessor.
    fn find(&self, memory: &[u8], address: u32) -> Result<(Option<Block>, Block), HeapError> {
        let header = self.header_of(memory, address)?;
        let mut previous = None;
        for block in self.blocks(memory) {
            let block = block?;
            if block.address == header {
                return Ok((previous, block));
            }
            if block.address > header {
                break;
            }
            previous = Some(block);
        }
        Err(self.invalid(address, PointerFault::NotABlock))
    }

    /// The cheap checks of a payload pointer, before walking the list.
    fn header_of(&self, memory: &[u8], address: u32) -> Result<u32, HeapError> {
        let header = address
            .checked_sub(HEADER_SIZE)
            .filter(|&header| header >= self.start && address < self.end)
            .ok_or_else(|| self.invalid(address, PointerFault::OutOfArena))?;
        if (header - self.start) % self.config.alignment != 0 {
            return Err(self.invalid(address, PointerFault::Misaligned));
        }
        if self.config.verify_tags && !block::has_tag(memory, header) {
            return Err(self.invalid(address, PointerFault::BadTag));
        }
        Ok(header)
    }

    fn intact(&self) -> Result<(), HeapError> {
        match self.corrupted.get() {
            Some(address) => Err(HeapError::ArenaCorruption { address }),
            None => Ok(()),
        }
    }

    /// Load the header at `address`, which is expected to be in the list.
    fn load(&self, memory: &[u8], address: u32) -> Result<Block, HeapError> {
        self.intact()?;
        let block = block::load(memory, address, self.config.verify_tags).map_err(|fault| {
            let reason = match fault {
                HeaderFault::OutOfBounds => "header outside of memory",
                HeaderFault::BadTag => "header tag mismatch",
                HeaderFault::BadFlag => "invalid free flag",
            };
            self.corruption(address, reason)
        })?;
        let end = address
            .checked_add(HEADER_SIZE)
            .and_then(|payload| payload.checked_add(block.size));
        match end {
            Some(end) if address >= self.start && end <= self.end => Ok(block),
            _ => Err(self.corruption(address, "block exceeds the arena")),
        }
    }

    /// Load the block following `block`, verifying the link between them.
    fn successor(&self, memory: &[u8], block: &Block) -> Result<Option<Block>, HeapError> {
        match block.next {
            None if block.end() == self.end => Ok(None),
            Some(next) if next == block.end() && next < self.end => self.load(memory, next).map(Some),
            _ => Err(self.corruption(block.address, "broken link")),
        }
    }

    fn store(&self, memory: &mut [u8], block: &Block) -> Result<(), HeapError> {
        block::store(memory, block).map_err(|_| self.corruption(block.address, "header outside of memory"))
    }

    fn invalid(&self, address: u32, fault: PointerFault) -> HeapError {
        log::warn!("invalid pointer {address:#x}: {fault}");
        HeapError::InvalidPointer { address, fault }
    }

    /// Report corruption at `address`. This permanently disables the heap.
    fn corruption(&self, address: u32, reason: &str) -> HeapError {
        log::error!("heap corrupted at {address:#x}: {reason}");
        let first = self.corrupted.get().unwrap_or(address);
        self.corrupted.set(Some(first));
        HeapError::ArenaCorruption { address: first }
    }
}

/// An iterator over the blocks of a [`Heap`], see [`Heap::blocks()`].
pub struct Blocks<'h, 'm> {
    heap: &'h Heap,
    memory: &'m [u8],
    state: State,
}
enum State {
    Start,
    After(Block),
    Done,
}
impl Iterator for Blocks<'_, '_> {
    type Item = Result<Block, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.state {
            State::Start => self.heap.load(self.memory, self.heap.start).map(Some),
            State::After(block) => self.heap.successor(self.memory, &block),
            State::Done => return None,
        };
        match next {
            Ok(Some(block)) => {
                self.state = State::After(block);
                Some(Ok(block))
            }
            Ok(None) => {
                self.state = State::Done;
                None
            }
            Err(error) => {
                self.state = State::Done;
                Some(Err(error))
            }
        }
    }
}
