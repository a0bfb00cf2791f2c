//! The memory layout registry at the foot of the address space.
//!
//! The host writes four little-endian `u32` values into the first bytes of
//! the module memory before the first call into the module:
//! ```text
//! 0x00        0x04        0x08        0x0c        0x10
//! +-----------+-----------+-----------+-----------+------ ...
//! | StrStart  | StrEnd    | HeapStart | HeapEnd   | (regions)
//! +-----------+-----------+-----------+-----------+------ ...
//! ```
//! The registry is read once during initialization and never changed
//! afterwards.
use crate::error::ConfigError;
use crate::memory::{read_u32, write_u32};
use core::ops::Range;

/// The number of bytes reserved for the registry at address `0`.
pub const REGISTRY_SIZE: u32 = 16;

const STR_START: u32 = 0;
const STR_END: u32 = 4;
const HEAP_START: u32 = 8;
const HEAP_END: u32 = 12;

/// The bounds of the string region and the heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub str_start: u32,
    pub str_end: u32,
    pub heap_start: u32,
    pub heap_end: u32,
}
impl MemoryLayout {
    /// Read the registry from `memory`.
    ///
    /// This does not validate the bounds, see [`validate()`](Self::validate).
    pub fn load(memory: &[u8]) -> Result<Self, ConfigError> {
        let slot = |offset| {
            read_u32(memory, offset).ok_or(ConfigError::MemoryTooSmall { size: memory.len() })
        };
        Ok(Self {
            str_start: slot(STR_START)?,
            str_end: slot(STR_END)?,
            heap_start: slot(HEAP_START)?,
            heap_end: slot(HEAP_END)?,
        })
    }

    /// Write the registry into `memory`. This is the host side of
    /// [`load()`](Self::load).
    pub fn store(&self, memory: &mut [u8]) -> Result<(), ConfigError> {
        if memory.len() < REGISTRY_SIZE as usize {
            return Err(ConfigError::MemoryTooSmall { size: memory.len() });
        }
        for (offset, value) in [
            (STR_START, self.str_start),
            (STR_END, self.str_end),
            (HEAP_START, self.heap_start),
            (HEAP_END, self.heap_end),
        ] {
            write_u32(memory, offset, value)
                .ok_or(ConfigError::MemoryTooSmall { size: memory.len() })?;
        }
        Ok(())
    }

    /// Check, that both regions are well-formed, disjoint and inside a
    /// memory of `memory_size` bytes (behind the registry).
    ///
    /// Size and alignment requirements of the heap arena are checked by the
    /// heap itself.
    pub fn validate(&self, memory_size: usize) -> Result<(), ConfigError> {
        for region in [self.strings(), self.heap()] {
            if region.start > region.end {
                return Err(ConfigError::InvertedRegion {
                    start: region.start,
                    end: region.end,
                });
            }
            // an empty region holds no bytes, so it cannot overlap the registry
            let in_registry = !region.is_empty() && region.start < REGISTRY_SIZE;
            if in_registry || region.end as usize > memory_size {
                return Err(ConfigError::RegionOutOfBounds {
                    start: region.start,
                    end: region.end,
                });
            }
        }
        let (strings, heap) = (self.strings(), self.heap());
        let empty = strings.is_empty() || heap.is_empty();
        if !empty && strings.start < heap.end && heap.start < strings.end {
            return Err(ConfigError::RegionsOverlap);
        }
        Ok(())
    }

    /// The string region `[StrStart, StrEnd)`.
    pub const fn strings(&self) -> Range<u32> {
        self.str_start..self.str_end
    }

    /// The heap arena `[HeapStart, HeapEnd)`.
    pub const fn heap(&self) -> Range<u32> {
        self.heap_start..self.heap_end
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryLayout, REGISTRY_SIZE};
    use crate::error::ConfigError;
    use crate::memory::Memory;

    const LAYOUT: MemoryLayout = MemoryLayout {
        str_start: 0x0400,
        str_end: 0x8400,
        heap_start: 0x8400,
        heap_end: 0x1_0000,
    };

    #[test]
    fn store_then_load() {
        let mut memory = Memory::<32>::new();
        LAYOUT.store(&mut memory).unwrap();
        assert_eq!(&memory[0..4], &[0x00, 0x04, 0x00, 0x00]);
        assert_eq!(&memory[12..16], &[0x00, 0x00, 0x01, 0x00]);
        assert_eq!(MemoryLayout::load(&memory), Ok(LAYOUT));
    }

    #[test]
    fn memory_too_small_for_registry() {
        let memory = [0u8; 15];
        assert_eq!(
            MemoryLayout::load(&memory),
            Err(ConfigError::MemoryTooSmall { size: 15 })
        );
        let mut memory = [0u8; 15];
        assert!(LAYOUT.store(&mut memory).is_err());
        assert!(memory.iter().all(|&b| b == 0));
    }

    #[test]
    fn valid_layout() {
        assert_eq!(LAYOUT.validate(0x1_0000), Ok(()));
    }

    #[test]
    fn region_past_memory_end() {
        assert_eq!(
            LAYOUT.validate(0x1_0000 - 1),
            Err(ConfigError::RegionOutOfBounds {
                start: 0x8400,
                end: 0x1_0000
            })
        );
    }

    #[test]
    fn region_inside_registry() {
        let layout = MemoryLayout {
            str_start: REGISTRY_SIZE - 4,
            ..LAYOUT
        };
        assert!(matches!(
            layout.validate(0x1_0000),
            Err(ConfigError::RegionOutOfBounds { .. })
        ));
    }

    #[test]
    fn inverted_region() {
        let layout = MemoryLayout {
            heap_start: 0x9000,
            heap_end: 0x8800,
            ..LAYOUT
        };
        assert_eq!(
            layout.validate(0x1_0000),
            Err(ConfigError::InvertedRegion {
                start: 0x9000,
                end: 0x8800
            })
        );
    }

    #[test]
    fn overlapping_regions() {
        let layout = MemoryLayout {
            heap_start: 0x8000,
            ..LAYOUT
        };
        assert_eq!(layout.validate(0x1_0000), Err(ConfigError::RegionsOverlap));
    }

    #[test]
    fn empty_string_region_never_overlaps() {
        let layout = MemoryLayout {
            str_start: 0x9000,
            str_end: 0x9000,
            ..LAYOUT
        };
        assert_eq!(layout.validate(0x1_0000), Ok(()));
    }

    #[test]
    fn empty_region_at_address_zero() {
        let layout = MemoryLayout {
            str_start: 0,
            str_end: 0,
            ..LAYOUT
        };
        assert_eq!(layout.validate(0x1_0000), Ok(()));
    }
}
