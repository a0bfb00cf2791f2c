//! The transient string arena.
//!
//! A bump allocator for short-lived encoded text passed between host and
//! module. Reservations are never freed: once the cursor reaches the end of
//! the region every further request fails, the head is not reused.
use crate::error::{ConfigError, StringError};
use crate::memory::region_mut;
use core::ops::Range;

/// A bump allocator over `[start, end)`.
#[derive(Debug, Clone)]
pub struct StringArena {
    start: u32,
    end: u32,
    cursor: u32,
    zero_on_reserve: bool,
}
impl StringArena {
    /// Create the arena over `region` of `memory`.
    ///
    /// If `zero_on_reserve` is set, every reservation is zeroed before it is
    /// handed out.
    pub fn new(memory: &[u8], region: Range<u32>, zero_on_reserve: bool) -> Result<Self, ConfigError> {
        let Range { start, end } = region;
        if start > end {
            return Err(ConfigError::InvertedRegion { start, end });
        }
        if end as usize > memory.len() {
            return Err(ConfigError::RegionOutOfBounds { start, end });
        }
        Ok(Self {
            start,
            end,
            cursor: start,
            zero_on_reserve,
        })
    }

    /// The total size of the arena.
    pub const fn capacity(&self) -> u32 {
        self.end - self.start
    }

    /// The number of bytes not yet reserved.
    pub const fn remaining(&self) -> u32 {
        self.end - self.cursor
    }

    /// The address of the next reservation.
    pub const fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Reserve room for a string of `size` bytes plus a NUL terminator.
    ///
    /// `size` is the string length without the terminator.
    pub fn reserve(&mut self, memory: &mut [u8], size: u32) -> Result<u32, StringError> {
        let total = size
            .checked_add(1)
            .filter(|&total| total <= self.capacity())
            .ok_or_else(|| {
                log::warn!(
                    "string of {size} bytes exceeds the string arena of {} bytes",
                    self.capacity()
                );
                StringError::TooLarge {
                    size,
                    capacity: self.capacity(),
                }
            })?;
        if total > self.remaining() {
            log::warn!(
                "string arena exhausted: {size} bytes requested, {} left",
                self.remaining()
            );
            return Err(StringError::Exhausted {
                size,
                remaining: self.remaining(),
            });
        }

        let start = self.cursor;
        if self.zero_on_reserve {
            if let Some(bytes) = region_mut(memory, start, total) {
                bytes.fill(0);
            }
        }
        self.cursor += total;
        log::trace!("reserve_string({size}) -> {start:#x}");
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::StringArena;
    use crate::error::{ConfigError, StringError};
    use crate::memory::Memory;

    #[test]
    fn reservations_are_consecutive() {
        let mut memory = Memory::<64>::new();
        let mut arena = StringArena::new(&memory, 16..48, true).unwrap();
        assert_eq!(arena.reserve(&mut memory, 4), Ok(16));
        assert_eq!(arena.reserve(&mut memory, 0), Ok(21));
        assert_eq!(arena.cursor(), 22);
        assert_eq!(arena.remaining(), 26);
        assert_eq!(arena.capacity(), 32);
    }

    #[test]
    fn reservations_are_zeroed() {
        let mut memory = Memory::<64>::new();
        memory.fill(0xFF);
        let mut arena = StringArena::new(&memory, 16..48, true).unwrap();
        let ptr = arena.reserve(&mut memory, 5).unwrap() as usize;
        assert_eq!(&memory[ptr..ptr + 6], &[0; 6]);
        assert_eq!(memory[ptr + 6], 0xFF);
    }

    #[test]
    fn zeroing_can_be_disabled() {
        let mut memory = Memory::<64>::new();
        memory.fill(0xFF);
        let mut arena = StringArena::new(&memory, 16..48, false).unwrap();
        let ptr = arena.reserve(&mut memory, 5).unwrap() as usize;
        assert_eq!(&memory[ptr..ptr + 6], &[0xFF; 6]);
    }

    #[test]
    fn too_large() {
        crate::testing::capture_logs();
        let mut memory = Memory::<64>::new();
        let mut arena = StringArena::new(&memory, 16..48, true).unwrap();
        assert_eq!(
            arena.reserve(&mut memory, 32),
            Err(StringError::TooLarge {
                size: 32,
                capacity: 32
            })
        );
        assert_eq!(
            arena.reserve(&mut memory, u32::MAX),
            Err(StringError::TooLarge {
                size: u32::MAX,
                capacity: 32
            })
        );
        assert!(crate::testing::logged(
            log::Level::Warn,
            "string of 32 bytes exceeds the string arena of 32 bytes"
        ));
        assert_eq!(arena.reserve(&mut memory, 31), Ok(16));
    }

    #[test]
    fn exhaustion_does_not_wrap_around() {
        let mut memory = Memory::<64>::new();
        let mut arena = StringArena::new(&memory, 16..48, true).unwrap();
        arena.reserve(&mut memory, 19).unwrap();
        assert_eq!(
            arena.reserve(&mut memory, 12),
            Err(StringError::Exhausted {
                size: 12,
                remaining: 12
            })
        );
        assert_eq!(arena.reserve(&mut memory, 11), Ok(36));
        assert_eq!(
            arena.reserve(&mut memory, 0),
            Err(StringError::Exhausted {
                size: 0,
                remaining: 0
            })
        );
    }

    #[test]
    fn invalid_region() {
        let memory = Memory::<64>::new();
        assert_eq!(
            StringArena::new(&memory, 16..65, true).map(|_| ()),
            Err(ConfigError::RegionOutOfBounds { start: 16, end: 65 })
        );
        assert_eq!(
            StringArena::new(&memory, 32..16, true).map(|_| ()),
            Err(ConfigError::InvertedRegion { start: 32, end: 16 })
        );
    }
}
