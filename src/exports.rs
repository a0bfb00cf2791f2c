//! The entry points of the wasm32 guest.
//!
//! All state lives in a single `static` module. Addresses on this boundary
//! are offsets from [`memory_base()`], which the host adds before touching
//! the memory. Results carrying a value are packed into a `u64`: the upper
//! half is the status (`0` on success, otherwise [`Error::code()`]), the
//! lower half the value. Plain status results are returned as `u32`.
use crate::diag::Host;
use crate::z85::Codec;
use crate::{Config, Error, Module};

/// The size of the module memory, the host places both regions inside.
const MEMORY_SIZE: usize = 64 * 1024;

static MODULE: Module<MEMORY_SIZE, Host> = Module::new(Config::DEFAULT, Host);

fn status(result: Result<(), Error>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(error) => error.code(),
    }
}

fn packed(result: Result<u32, Error>) -> u64 {
    match result {
        Ok(value) => u64::from(value),
        Err(error) => u64::from(error.code()) << 32,
    }
}

fn codec_value(f: impl FnOnce(&Codec) -> u32) -> u64 {
    packed(MODULE.codec().map(|codec| f(&codec)))
}

/// The address of the module memory inside the linear memory.
#[no_mangle]
pub extern "C" fn memory_base() -> *mut u8 {
    MODULE
        .with_memory(|memory| memory.as_mut_ptr())
        .unwrap_or(core::ptr::null_mut())
}

#[no_mangle]
pub extern "C" fn memory_size() -> u32 {
    MEMORY_SIZE as u32
}

/// Initialize the module from the layout registry written by the host.
///
/// No logger is installed: errors reach the host once, through the module
/// diagnostics, after the module is unlocked again.
#[no_mangle]
pub extern "C" fn init() -> u32 {
    status(MODULE.init().map(|_| ()))
}

#[no_mangle]
pub extern "C" fn heap_alloc(size: u32) -> u64 {
    packed(MODULE.allocate(size))
}

#[no_mangle]
pub extern "C" fn heap_free(ptr: u32) -> u32 {
    status(MODULE.free(ptr))
}

/// The usable size of the block at `ptr`.
#[no_mangle]
pub extern "C" fn heap_block_size(ptr: u32) -> u64 {
    packed(MODULE.block_for(ptr).map(|block| block.size))
}

#[no_mangle]
pub extern "C" fn request_str_ptr(size: u32) -> u64 {
    packed(MODULE.reserve_string(size))
}

#[no_mangle]
pub extern "C" fn z85_init(max_data_size: u32) -> u32 {
    status(MODULE.codec_init(max_data_size).map(|_| ()))
}

/// Encode the decoded buffer, returning the number of characters.
#[no_mangle]
pub extern "C" fn z85_encode() -> u64 {
    packed(MODULE.encode())
}

/// Decode the encoded buffer, returning the logical data size.
#[no_mangle]
pub extern "C" fn z85_decode() -> u64 {
    packed(MODULE.decode())
}

#[no_mangle]
pub extern "C" fn z85_decoded_ptr() -> u64 {
    codec_value(Codec::decoded_ptr)
}

#[no_mangle]
pub extern "C" fn z85_encoded_ptr() -> u64 {
    codec_value(Codec::encoded_ptr)
}

#[no_mangle]
pub extern "C" fn z85_data_size_ptr() -> u64 {
    codec_value(Codec::data_size_ptr)
}

#[no_mangle]
pub extern "C" fn z85_decoded_size_max() -> u64 {
    codec_value(Codec::decoded_size_max)
}

#[no_mangle]
pub extern "C" fn z85_encoded_size_max() -> u64 {
    codec_value(Codec::encoded_size_max)
}

#[no_mangle]
pub extern "C" fn z85_padded_data_size() -> u64 {
    packed(MODULE.padded_data_size())
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
    core::arch::wasm32::unreachable()
}
