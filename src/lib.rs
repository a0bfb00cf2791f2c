//! Memory manager for sandboxed WebAssembly modules
//!
//! This crate manages the memory of a module, that runs inside a single,
//! bounded, byte-addressable memory region shared with a host process. There
//! is no operating system allocator and the address space cannot grow. The
//! host decides at startup, which part of the memory is used for what, and
//! writes that decision into a small [registry](layout) at address `0`.
//!
//! The central type is [`Module`]: it owns the address space and provides
//! - a [block heap](heap) with split-on-demand and coalescing free,
//! - a never-freeing [string arena](strings) for short-lived text and
//! - [Z85](z85) codec buffers, allocated from the heap.
//!
//! # Usage
//! ```
//! use sandheap::{Config, MemoryLayout, Module, Silent};
//!
//! let module = Module::<4096>::new(Config::DEFAULT, Silent);
//! // the host writes the layout before the first call
//! module
//!     .write_layout(&MemoryLayout {
//!         str_start: 0x0010,
//!         str_end: 0x0400,
//!         heap_start: 0x0400,
//!         heap_end: 0x1000,
//!     })
//!     .unwrap();
//! module.init().unwrap();
//!
//! let ptr = module.allocate(100).unwrap();
//! module.with_memory(|memory| memory[ptr as usize] = 42).unwrap();
//! module.free(ptr).unwrap();
//! ```
//! For a wasm32 guest the `exports` feature provides the entry points the
//! host calls, backed by a `static` module.
//!
//! # Implementation
//! The heap is a linear list of blocks, each with a 16 byte header in front
//! of its payload. The headers live in the shared memory, so the host can
//! inspect the heap at any time. The basic algorithm is as follows (using an
//! arena of 1024 bytes and the default configuration):
//! 1.  Initially there is a single free block.
//!     ```text
//!     hhhh 0000 ..................................... 0000
//!     ^--- ^-------------------------------------------
//!     FREE size = 1008
//!     ```
//!     It spans all the remaining arena bytes after its header.
//! 2.  A block of 100 is allocated.
//!     ```text
//!     hhhh 0000 ... 0000 hhhh 0000 ................... 0000
//!     ^--- ^------------ ^--- ^------------------------
//!     USED size = 100    FREE size = 892
//!     ```
//!     The only free block is split into two: a used block of exactly the
//!     requested size and a new free block directly behind it. The total
//!     usable space shrank by 16 bytes, the size of the additional header.
//! 3.  A block of 2000 is requested. No free block is large enough, so the
//!     allocation fails with [`OutOfMemory`](error::HeapError::OutOfMemory).
//!     Nothing is modified.
//! 4.  A block of 880 is requested. The free block of 892 bytes is large
//!     enough, but the remainder of 12 bytes cannot hold another header plus
//!     the minimum payload of 4 bytes. Therefore the whole block is handed
//!     out, the caller gets 12 bytes more than requested.
//! 5.  The block of step 2 is freed.
//!     ```text
//!     hhhh 0000 ... 0000 hhhh 0000 ................... 0000
//!     ^--- ^------------ ^--- ^------------------------
//!     FREE size = 100    USED size = 892
//!     ```
//!     The free block cannot be merged, since its neighbor is used.
//! 6.  The block of step 4 is freed.
//!     ```text
//!     hhhh 0000 ..................................... 0000
//!     ^--- ^-------------------------------------------
//!     FREE size = 1008
//!     ```
//!     The freed block is merged into the free block in front of it. Since
//!     the list is only linked forward, the predecessor is found by scanning
//!     from the start of the arena. Freeing has to walk the list anyway in
//!     order to verify, that the pointer belongs to a block, so this is no
//!     extra cost. The picture of step 1 is restored.
//!
//! Requests are rounded up to the configured alignment (4 by default), the
//! padding is part of the used block. Pointers, that are not the payload of
//! a used block, are rejected with
//! [`InvalidPointer`](error::HeapError::InvalidPointer) and never modify the
//! heap. A damaged header is detected by its tag and the list links and
//! permanently disables the heap, as continuing would mean interpreting
//! arbitrary bytes as a header.
//!
//! # Concurrency
//! The module is built for a single-threaded host, that calls one entry
//! point at a time. The state is guarded by a spin lock, which is never
//! waited on: a call, that finds the lock taken, fails with [`Error::Busy`].
//! This happens if the module is re-entered, e.g. from within
//! [`Module::with_memory()`], which is forbidden.
#![no_std]

pub mod diag;
pub mod error;
#[cfg(all(target_arch = "wasm32", feature = "exports"))]
mod exports;
pub mod heap;
pub mod layout;
pub mod memory;
pub mod strings;
#[cfg(test)]
mod testing;
pub mod z85;

pub use diag::{Diagnostics, Scalar, Silent};
pub use error::Error;
pub use heap::{Block, Heap, HeapConfig, HeapStats};
pub use layout::MemoryLayout;
pub use memory::Memory;

use diag::MessageBuffer;
use error::{HeapError, PointerFault};
use layout::REGISTRY_SIZE;
use strings::StringArena;
use z85::Codec;

/// The configuration of a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The tunables of the heap.
    pub heap: HeapConfig,
    /// Zero every string reservation before handing it out.
    pub zero_strings: bool,
}
impl Config {
    /// The default configuration, see [`HeapConfig::new()`].
    pub const DEFAULT: Self = Self::new();

    pub const fn new() -> Self {
        Self {
            heap: HeapConfig::new(),
            zero_strings: true,
        }
    }

    pub const fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }

    pub const fn with_zeroed_strings(mut self, zero_strings: bool) -> Self {
        self.zero_strings = zero_strings;
        self
    }
}
impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// The allocators, that exist after initialization.
struct State {
    layout: MemoryLayout,
    heap: Heap,
    strings: StringArena,
    codec: Option<Codec>,
}

struct Instance<const N: usize> {
    memory: Memory<N>,
    state: Option<State>,
}

/// A module instance with an address space of `N` bytes.
///
/// Every error returned by the methods is also reported to the
/// [`Diagnostics`] `D` before it is returned.
pub struct Module<const N: usize, D = Silent> {
    instance: spin::Mutex<Instance<N>>,
    config: Config,
    diagnostics: D,
}
impl<const N: usize, D: Diagnostics> Module<N, D> {
    /// Create a new, uninitialized [`Module`].
    ///
    /// This function is a `const fn`, so the module can be placed in a
    /// `static`. The memory is zeroed.
    ///
    /// # Panics
    /// This function panics if `N` cannot hold the layout registry or is not
    /// addressable with 32 bits.
    pub const fn new(config: Config, diagnostics: D) -> Self {
        assert!(
            N >= REGISTRY_SIZE as usize,
            "too small module memory: minimum size is 16"
        );
        assert!(
            N as u64 <= u32::MAX as u64,
            "module memory must be addressable with 32 bits"
        );
        Self {
            instance: spin::Mutex::new(Instance {
                memory: Memory::new(),
                state: None,
            }),
            config,
            diagnostics,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Write the layout registry. This is what the host does before calling
    /// [`init()`](Self::init).
    pub fn write_layout(&self, layout: &MemoryLayout) -> Result<(), Error> {
        self.locked(|instance| {
            if instance.state.is_some() {
                return Err(Error::AlreadyInitialized);
            }
            Ok(layout.store(&mut instance.memory)?)
        })
    }

    /// Read the layout registry and set up the heap and the string arena.
    ///
    /// The registry is treated as read-only afterwards. This can be done
    /// exactly once.
    pub fn init(&self) -> Result<MemoryLayout, Error> {
        self.locked(|instance| {
            if instance.state.is_some() {
                return Err(Error::AlreadyInitialized);
            }
            let memory = &mut instance.memory;
            let layout = MemoryLayout::load(memory)?;
            layout.validate(N)?;
            let heap = Heap::initialize(memory, layout.heap(), self.config.heap)?;
            let strings = StringArena::new(memory, layout.strings(), self.config.zero_strings)?;
            log::debug!("module initialized: {layout:?}");

            instance.state = Some(State {
                layout,
                heap,
                strings,
                codec: None,
            });
            Ok(layout)
        })
    }

    /// The layout read during initialization.
    pub fn layout(&self) -> Result<MemoryLayout, Error> {
        self.run(|_, state| Ok(state.layout))
    }

    /// Access the raw memory, e.g. to fill or read a payload.
    ///
    /// This works before initialization as well. Calling into the module
    /// from within `f` fails with [`Error::Busy`].
    pub fn with_memory<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, Error> {
        self.locked(|instance| Ok(f(&mut instance.memory)))
    }

    /// Allocate a heap block of at least `size` bytes, see
    /// [`Heap::allocate()`].
    pub fn allocate(&self, size: u32) -> Result<u32, Error> {
        self.run(|memory, state| Ok(state.heap.allocate(memory, size)?))
    }

    /// Free the heap block at `address`, see [`Heap::free()`].
    ///
    /// The codec buffers are rejected, they are freed by
    /// [`codec_release()`](Self::codec_release).
    pub fn free(&self, address: u32) -> Result<(), Error> {
        self.run(|memory, state| {
            if state.codec.as_ref().is_some_and(|codec| codec.owns(address)) {
                log::warn!("invalid pointer {address:#x}: codec buffer");
                return Err(HeapError::InvalidPointer {
                    address,
                    fault: PointerFault::CodecBuffer,
                }
                .into());
            }
            Ok(state.heap.free(memory, address)?)
        })
    }

    /// Recover the heap block of `address`, see [`Heap::block_for()`].
    pub fn block_for(&self, address: u32) -> Result<Block, Error> {
        self.run(|memory, state| Ok(state.heap.block_for(memory, address)?))
    }

    /// Verify and summarize the heap, see [`Heap::check()`].
    pub fn check(&self) -> Result<HeapStats, Error> {
        self.run(|memory, state| Ok(state.heap.check(memory)?))
    }

    /// Reserve room for a string of `size` bytes (plus terminator) in the
    /// string arena.
    pub fn reserve_string(&self, size: u32) -> Result<u32, Error> {
        self.run(|memory, state| Ok(state.strings.reserve(memory, size)?))
    }

    /// Allocate the codec buffers for up to `max_data_size` bytes.
    ///
    /// Buffers of a previous call are released first.
    pub fn codec_init(&self, max_data_size: u32) -> Result<Codec, Error> {
        self.run(|memory, state| {
            if let Some(codec) = state.codec.take() {
                codec.release(&mut state.heap, memory)?;
            }
            let codec = Codec::new(&mut state.heap, memory, max_data_size)?;
            state.codec = Some(codec.clone());
            Ok(codec)
        })
    }

    /// The codec buffers.
    pub fn codec(&self) -> Result<Codec, Error> {
        self.run(|_, state| state.codec.clone().ok_or(Error::CodecUninitialized))
    }

    /// Free the codec buffers.
    pub fn codec_release(&self) -> Result<(), Error> {
        self.run(|memory, state| {
            let codec = state.codec.take().ok_or(Error::CodecUninitialized)?;
            Ok(codec.release(&mut state.heap, memory)?)
        })
    }

    /// The logical data size in the codec size slot, rounded up to a
    /// multiple of 4.
    pub fn padded_data_size(&self) -> Result<u32, Error> {
        self.run(|memory, state| {
            let codec = state.codec.as_ref().ok_or(Error::CodecUninitialized)?;
            Ok(codec.padded_data_size(memory)?)
        })
    }

    /// Encode the decoded codec buffer, returning the number of characters.
    pub fn encode(&self) -> Result<u32, Error> {
        self.run(|memory, state| {
            let codec = state.codec.as_ref().ok_or(Error::CodecUninitialized)?;
            Ok(codec.encode(memory)?)
        })
    }

    /// Decode the encoded codec buffer, returning the logical data size.
    pub fn decode(&self) -> Result<u32, Error> {
        self.run(|memory, state| {
            let codec = state.codec.as_ref().ok_or(Error::CodecUninitialized)?;
            Ok(codec.decode(memory)?)
        })
    }

    /// Run `f` on the initialized state.
    fn run<T>(&self, f: impl FnOnce(&mut Memory<N>, &mut State) -> Result<T, Error>) -> Result<T, Error> {
        self.locked(|instance| match &mut instance.state {
            Some(state) => f(&mut instance.memory, state),
            None => Err(Error::Uninitialized),
        })
    }

    /// Run `f` with the lock held and report a failure afterwards.
    fn locked<T>(&self, f: impl FnOnce(&mut Instance<N>) -> Result<T, Error>) -> Result<T, Error> {
        let result = match self.instance.try_lock() {
            Some(mut instance) => f(&mut *instance),
            None => Err(Error::Busy),
        };
        // the lock is released here, so a diagnostics callback cannot observe
        // a half-finished operation
        if let Err(error) = &result {
            self.report(error);
        }
        result
    }

    fn report(&self, error: &Error) {
        let message = MessageBuffer::format(format_args!("{error}"));
        self.diagnostics
            .print(message.as_str(), true, error.scalar());
    }
}
