//! The address space of the module and bounds-checked access into it.
//!
//! Every component of this crate addresses memory with plain `u32` offsets
//! from the start of the address space, exactly as the host sees it. Nothing
//! ever holds a native pointer into the buffer: all reads and writes go
//! through the accessors below, which return `None` instead of touching bytes
//! outside of the slice.
use core::ops::{Deref, DerefMut};

/// The memory backing the whole address space of a module.
///
/// The buffer is zero-initialized, so a `static` module lands in `.bss`
/// rather than carrying `N` bytes of initialization data. It is aligned to
/// 16 bytes, the strictest payload alignment the heap supports.
#[repr(align(16))]
pub struct Memory<const N: usize>([u8; N]);
impl<const N: usize> Memory<N> {
    /// Create a new, zeroed address space.
    pub const fn new() -> Self {
        Self([0; N])
    }
}
impl<const N: usize> Default for Memory<N> {
    fn default() -> Self {
        Self::new()
    }
}
impl<const N: usize> Deref for Memory<N> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl<const N: usize> DerefMut for Memory<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Borrow `len` bytes at `offset`, if they are all inside `memory`.
pub(crate) fn region(memory: &[u8], offset: u32, len: u32) -> Option<&[u8]> {
    let start = offset as usize;
    let end = start.checked_add(len as usize)?;
    memory.get(start..end)
}

/// Mutably borrow `len` bytes at `offset`, if they are all inside `memory`.
pub(crate) fn region_mut(memory: &mut [u8], offset: u32, len: u32) -> Option<&mut [u8]> {
    let start = offset as usize;
    let end = start.checked_add(len as usize)?;
    memory.get_mut(start..end)
}

/// Read a little-endian `u32` at `offset`.
pub(crate) fn read_u32(memory: &[u8], offset: u32) -> Option<u32> {
    let bytes = region(memory, offset, 4)?;
    let mut raw = [0; 4];
    raw.copy_from_slice(bytes);
    Some(u32::from_le_bytes(raw))
}

/// Write a little-endian `u32` at `offset`.
///
/// Returns `None` (and writes nothing) if the four bytes are not all inside
/// `memory`.
pub(crate) fn write_u32(memory: &mut [u8], offset: u32, value: u32) -> Option<()> {
    region_mut(memory, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Some(())
}

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` if the result does not fit into a `u32`.
pub(crate) const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{align_up, read_u32, region, write_u32, Memory};

    #[test]
    fn new_memory_is_zeroed_and_aligned() {
        let memory = Memory::<64>::new();
        assert!(memory.iter().all(|&b| b == 0));
        assert_eq!(memory.as_ptr() as usize % 16, 0);
    }

    #[test]
    fn u32_access_is_little_endian() {
        let mut memory = Memory::<16>::new();
        assert_eq!(write_u32(&mut memory, 4, 0x0403_0201), Some(()));
        assert_eq!(&memory[4..8], &[1, 2, 3, 4]);
        assert_eq!(read_u32(&memory, 4), Some(0x0403_0201));
    }

    #[test]
    fn out_of_bounds_access() {
        let mut memory = Memory::<16>::new();
        assert_eq!(read_u32(&memory, 13), None);
        assert_eq!(write_u32(&mut memory, 13, 1), None);
        assert!(memory.iter().all(|&b| b == 0), "partial write happened");
        assert_eq!(read_u32(&memory, u32::MAX), None);
        assert!(region(&memory, 12, 4).is_some());
        assert!(region(&memory, 12, 5).is_none());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 4), Some(0));
        assert_eq!(align_up(1, 4), Some(4));
        assert_eq!(align_up(100, 4), Some(100));
        assert_eq!(align_up(100, 16), Some(112));
        assert_eq!(align_up(7, 1), Some(7));
        assert_eq!(align_up(u32::MAX - 1, 4), None);
    }
}
