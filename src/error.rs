//! Error types of all components.
//!
//! Every component reports its own error enum. [`Error`] is the union the
//! [`Module`](crate::Module) hands out, which additionally knows the stable
//! numeric [`code`](Error::code) used on the export boundary.
use crate::diag::Scalar;
use thiserror::Error;

/// The host-provided memory layout or the allocator configuration is
/// unusable.
///
/// Configuration errors are fatal: the module refuses to initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The address space cannot even hold the layout registry.
    #[error("memory of {size} bytes cannot hold the layout registry")]
    MemoryTooSmall { size: usize },
    /// A region ends before it starts.
    #[error("region {start:#x}..{end:#x} ends before it starts")]
    InvertedRegion { start: u32, end: u32 },
    /// A region reaches past the end of the address space or into the
    /// layout registry.
    #[error("region {start:#x}..{end:#x} is outside of the usable memory")]
    RegionOutOfBounds { start: u32, end: u32 },
    /// The string region and the heap region share bytes.
    #[error("string region and heap region overlap")]
    RegionsOverlap,
    /// The heap arena cannot hold a single header plus the minimum payload.
    #[error("arena of {size} bytes is too small, at least {required} bytes are needed")]
    ArenaTooSmall { size: u32, required: u32 },
    /// The heap arena does not start on the payload alignment.
    #[error("arena start {start:#x} is not aligned to {alignment} bytes")]
    MisalignedArena { start: u32, alignment: u32 },
    /// The configured alignment is not a power of two in `1..=16`.
    #[error("alignment {0} is not a power of two between 1 and 16")]
    InvalidAlignment(u32),
    /// The configured minimum payload is zero.
    #[error("minimum payload must be at least one byte")]
    InvalidMinPayload,
}

/// The reason a pointer was rejected by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PointerFault {
    /// The pointer does not point behind a header inside the arena.
    #[error("outside of the arena")]
    OutOfArena,
    /// The pointer is not on the payload alignment.
    #[error("misaligned")]
    Misaligned,
    /// The bytes in front of the pointer do not carry the header tag.
    #[error("no block header in front of it")]
    BadTag,
    /// The pointer is not the payload of any block in the list.
    #[error("not the start of a block")]
    NotABlock,
    /// The block is free, e.g. because of a double free.
    #[error("block is not allocated")]
    NotAllocated,
    /// The block holds one of the codec buffers, which are released with
    /// the codec only.
    #[error("block is owned by the codec")]
    CodecBuffer,
}

/// An error of the [`Heap`](crate::heap::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// No free block is large enough. Nothing was changed.
    #[error("out of memory: no free block for {requested} bytes")]
    OutOfMemory { requested: u32 },
    /// A pointer passed to `free()` or `block_for()` does not belong to a
    /// block. Nothing was changed.
    #[error("invalid pointer {address:#x}: {fault}")]
    InvalidPointer { address: u32, fault: PointerFault },
    /// A header in the block list is damaged. The heap stops servicing
    /// requests after this.
    #[error("heap arena corrupted at {address:#x}")]
    ArenaCorruption { address: u32 },
}

/// An error of the [`StringArena`](crate::strings::StringArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StringError {
    /// The string (plus its terminator) is larger than the whole arena.
    #[error("string of {size} bytes does not fit into the string arena of {capacity} bytes")]
    TooLarge { size: u32, capacity: u32 },
    /// The arena has not enough space left.
    #[error("string arena exhausted: {size} bytes requested, {remaining} bytes left")]
    Exhausted { size: u32, remaining: u32 },
}

/// An error of the Z85 codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The input length is not a multiple of the group size.
    #[error("input of {len} bytes is not a multiple of {multiple}")]
    UnalignedInput { len: usize, multiple: usize },
    /// A character outside of the Z85 alphabet.
    #[error("invalid character {byte:#04x} at position {position}")]
    InvalidCharacter { position: usize, byte: u8 },
    /// A group of five characters encodes a value above `u32::MAX`.
    #[error("group at position {position} overflows 32 bits")]
    Overflow { position: usize },
    /// The output buffer is too small.
    #[error("output buffer of {available} bytes is too small, {needed} bytes needed")]
    OutputTooSmall { needed: usize, available: usize },
    /// The data size exceeds the buffers allocated for the codec.
    #[error("data size {size} exceeds the maximum of {max} bytes")]
    DataTooLarge { size: u32, max: u32 },
    /// A codec buffer is not inside the module memory.
    #[error("codec buffer at {address:#x} is outside of the memory")]
    BufferOutOfBounds { address: u32 },
}

/// Any error reported by a [`Module`](crate::Module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    String(#[from] StringError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The module was used before [`init()`](crate::Module::init).
    #[error("module is not initialized")]
    Uninitialized,
    /// [`init()`](crate::Module::init) was called a second time.
    #[error("module is already initialized")]
    AlreadyInitialized,
    /// The module was re-entered, e.g. from a diagnostics callback.
    #[error("module is busy (re-entrant call)")]
    Busy,
    /// A codec operation was requested before the codec buffers exist.
    #[error("codec buffers are not allocated")]
    CodecUninitialized,
}
impl Error {
    /// The stable numeric code of this error on the export boundary.
    ///
    /// `0` is reserved for success.
    pub const fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 1,
            Error::Heap(HeapError::OutOfMemory { .. }) => 2,
            Error::Heap(HeapError::InvalidPointer { .. }) => 3,
            Error::Heap(HeapError::ArenaCorruption { .. }) => 4,
            Error::String(StringError::TooLarge { .. }) => 5,
            Error::String(StringError::Exhausted { .. }) => 6,
            Error::Codec(_) => 7,
            Error::Uninitialized => 8,
            Error::AlreadyInitialized => 9,
            Error::Busy => 10,
            Error::CodecUninitialized => 11,
        }
    }

    /// The offending size or address, if the error carries one.
    pub const fn scalar(&self) -> Option<Scalar> {
        match *self {
            Error::Config(ConfigError::ArenaTooSmall { size, .. }) => Some(Scalar::Count(size)),
            Error::Config(ConfigError::MisalignedArena { start, .. }) => {
                Some(Scalar::Address(start))
            }
            Error::Heap(HeapError::OutOfMemory { requested }) => Some(Scalar::Value(requested)),
            Error::Heap(HeapError::InvalidPointer { address, .. })
            | Error::Heap(HeapError::ArenaCorruption { address }) => Some(Scalar::Address(address)),
            Error::String(StringError::TooLarge { size, .. })
            | Error::String(StringError::Exhausted { size, .. })
            | Error::Codec(CodecError::DataTooLarge { size, .. }) => Some(Scalar::Value(size)),
            _ => None,
        }
    }
}
