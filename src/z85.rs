//! The Z85 codec and its buffers on the heap.
//!
//! Z85 is the base85 variant of ZeroMQ: every 4 bytes of binary data are
//! read as a big-endian `u32` and written as 5 characters of an 85 symbol
//! alphabet, that is safe to embed in source code and JSON strings.
//!
//! The host exchanges data with the codec through three blocks allocated
//! from the heap once: the decoded (binary) buffer, the encoded (text)
//! buffer and a `u32` slot with the logical size of the decoded data. Binary
//! data is zero-padded to a multiple of 4 bytes before encoding, the padding
//! is not part of the logical size.
use crate::error::{CodecError, Error, HeapError};
use crate::heap::Heap;
use crate::memory::{align_up, read_u32, region, region_mut, write_u32};

/// The encoding alphabet.
pub const ALPHABET: &[u8; 85] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

const INVALID: u8 = 0xFF;
const DECODER: [u8; 256] = {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// The number of characters needed for `len` bytes of (padded) input.
pub const fn encoded_len(len: u32) -> Option<u32> {
    (len / 4).checked_mul(5)
}

/// `len` rounded up to the next multiple of 4.
pub const fn padded_len(len: u32) -> Option<u32> {
    align_up(len, 4)
}

/// Encode `input` into `output`, returning the number of characters written.
///
/// The input length has to be a multiple of 4.
pub fn encode(input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
    if input.len() % 4 != 0 {
        return Err(CodecError::UnalignedInput {
            len: input.len(),
            multiple: 4,
        });
    }
    let needed = input.len() / 4 * 5;
    if output.len() < needed {
        return Err(CodecError::OutputTooSmall {
            needed,
            available: output.len(),
        });
    }

    for (group, chars) in input.chunks_exact(4).zip(output.chunks_exact_mut(5)) {
        let mut value = u32::from_be_bytes([group[0], group[1], group[2], group[3]]);
        for c in chars.iter_mut().rev() {
            *c = ALPHABET[(value % 85) as usize];
            value /= 85;
        }
    }
    Ok(needed)
}

/// Decode `input` into `output`, returning the number of bytes written.
///
/// The input length has to be a multiple of 5.
pub fn decode(input: &[u8], output: &mut [u8]) -> Result<usize, CodecError> {
    if input.len() % 5 != 0 {
        return Err(CodecError::UnalignedInput {
            len: input.len(),
            multiple: 5,
        });
    }
    let needed = input.len() / 5 * 4;
    if output.len() < needed {
        return Err(CodecError::OutputTooSmall {
            needed,
            available: output.len(),
        });
    }

    for (i, (chars, group)) in input
        .chunks_exact(5)
        .zip(output.chunks_exact_mut(4))
        .enumerate()
    {
        let mut value = 0u64;
        for (j, &c) in chars.iter().enumerate() {
            let digit = DECODER[c as usize];
            if digit == INVALID {
                return Err(CodecError::InvalidCharacter {
                    position: i * 5 + j,
                    byte: c,
                });
            }
            value = value * 85 + u64::from(digit);
        }
        let value = u32::try_from(value).map_err(|_| CodecError::Overflow { position: i * 5 })?;
        group.copy_from_slice(&value.to_be_bytes());
    }
    Ok(needed)
}

/// The codec buffers inside the module memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    decoded: u32,
    encoded: u32,
    data_size: u32,
    max_data_size: u32,
}
impl Codec {
    /// Allocate the buffers for up to `max_data_size` bytes of binary data.
    ///
    /// If one of the allocations fails, the already allocated buffers are
    /// released again.
    pub fn new(heap: &mut Heap, memory: &mut [u8], max_data_size: u32) -> Result<Self, Error> {
        let too_large = CodecError::DataTooLarge {
            size: max_data_size,
            max: u32::MAX / 5 * 4 - 4,
        };
        let decoded_size = padded_len(max_data_size).ok_or(too_large)?;
        let encoded_size = encoded_len(decoded_size)
            .and_then(|len| len.checked_add(1))
            .ok_or(too_large)?;

        let decoded = heap.allocate(memory, decoded_size)?;
        let encoded = match heap.allocate(memory, encoded_size) {
            Ok(encoded) => encoded,
            Err(e) => return Err(Self::rollback(heap, memory, &[decoded], e)),
        };
        let data_size = match heap.allocate(memory, 4) {
            Ok(data_size) => data_size,
            Err(e) => return Err(Self::rollback(heap, memory, &[decoded, encoded], e)),
        };

        let codec = Self {
            decoded,
            encoded,
            data_size,
            max_data_size: decoded_size,
        };
        codec.set_data_size(memory, 0)?;
        log::debug!(
            "codec buffers: decoded {decoded:#x} ({decoded_size} bytes), encoded {encoded:#x} ({encoded_size} bytes)"
        );
        Ok(codec)
    }

    fn rollback(heap: &mut Heap, memory: &mut [u8], buffers: &[u32], error: HeapError) -> Error {
        for &buffer in buffers {
            if let Err(e) = heap.free(memory, buffer) {
                log::error!("releasing codec buffer {buffer:#x} failed: {e}");
            }
        }
        error.into()
    }

    /// Free all buffers.
    pub fn release(self, heap: &mut Heap, memory: &mut [u8]) -> Result<(), HeapError> {
        heap.free(memory, self.data_size)?;
        heap.free(memory, self.encoded)?;
        heap.free(memory, self.decoded)
    }

    /// The address of the decoded (binary) buffer.
    pub const fn decoded_ptr(&self) -> u32 {
        self.decoded
    }

    /// The address of the encoded (text) buffer.
    pub const fn encoded_ptr(&self) -> u32 {
        self.encoded
    }

    /// The address of the `u32` slot holding the logical data size.
    pub const fn data_size_ptr(&self) -> u32 {
        self.data_size
    }

    /// Whether `address` is one of the buffers.
    pub const fn owns(&self, address: u32) -> bool {
        address == self.decoded || address == self.encoded || address == self.data_size
    }

    /// The capacity of the decoded buffer, a multiple of 4.
    pub const fn decoded_size_max(&self) -> u32 {
        self.max_data_size
    }

    /// The capacity of the encoded buffer without the terminator.
    pub const fn encoded_size_max(&self) -> u32 {
        self.max_data_size / 4 * 5
    }

    /// The logical size of the decoded data.
    pub fn data_size(&self, memory: &[u8]) -> Result<u32, CodecError> {
        let size = read_u32(memory, self.data_size).ok_or(CodecError::BufferOutOfBounds {
            address: self.data_size,
        })?;
        if size > self.max_data_size {
            return Err(CodecError::DataTooLarge {
                size,
                max: self.max_data_size,
            });
        }
        Ok(size)
    }

    pub fn set_data_size(&self, memory: &mut [u8], size: u32) -> Result<(), CodecError> {
        if size > self.max_data_size {
            return Err(CodecError::DataTooLarge {
                size,
                max: self.max_data_size,
            });
        }
        write_u32(memory, self.data_size, size).ok_or(CodecError::BufferOutOfBounds {
            address: self.data_size,
        })
    }

    /// The logical data size rounded up to a multiple of 4.
    pub fn padded_data_size(&self, memory: &[u8]) -> Result<u32, CodecError> {
        // cannot overflow, the size is bounded by the (padded) capacity
        Ok(self.data_size(memory)?.next_multiple_of(4))
    }

    /// Encode the decoded buffer into the encoded buffer.
    ///
    /// The decoded data is zero-padded in place and the encoded text is
    /// NUL-terminated. Returns the number of characters.
    pub fn encode(&self, memory: &mut [u8]) -> Result<u32, CodecError> {
        let size = self.data_size(memory)?;
        let padded = self.padded_data_size(memory)?;
        self.buffer_mut(memory, self.decoded + size, padded - size)?
            .fill(0);

        let groups = padded / 4;
        for i in 0..groups {
            let mut group = [0; 4];
            group.copy_from_slice(self.buffer(memory, self.decoded + i * 4, 4)?);
            let mut chars = [0; 5];
            encode(&group, &mut chars)?;
            self.buffer_mut(memory, self.encoded + i * 5, 5)?
                .copy_from_slice(&chars);
        }
        let len = groups * 5;
        self.buffer_mut(memory, self.encoded + len, 1)?[0] = 0;
        log::trace!("encoded {size} bytes into {len} characters");
        Ok(len)
    }

    /// Decode the encoded buffer into the decoded buffer.
    ///
    /// The number of characters read is derived from the logical data size.
    /// Returns the logical data size.
    pub fn decode(&self, memory: &mut [u8]) -> Result<u32, CodecError> {
        let size = self.data_size(memory)?;
        let groups = self.padded_data_size(memory)? / 4;
        for i in 0..groups {
            let mut chars = [0; 5];
            chars.copy_from_slice(self.buffer(memory, self.encoded + i * 5, 5)?);
            let mut group = [0; 4];
            decode(&chars, &mut group).map_err(|e| match e {
                CodecError::InvalidCharacter { position, byte } => CodecError::InvalidCharacter {
                    position: position + i as usize * 5,
                    byte,
                },
                CodecError::Overflow { position } => CodecError::Overflow {
                    position: position + i as usize * 5,
                },
                other => other,
            })?;
            self.buffer_mut(memory, self.decoded + i * 4, 4)?
                .copy_from_slice(&group);
        }
        log::trace!("decoded {} characters into {size} bytes", groups * 5);
        Ok(size)
    }

    fn buffer<'m>(&self, memory: &'m [u8], address: u32, len: u32) -> Result<&'m [u8], CodecError> {
        region(memory, address, len).ok_or(CodecError::BufferOutOfBounds { address })
    }

    fn buffer_mut<'m>(
        &self,
        memory: &'m mut [u8],
        address: u32,
        len: u32,
    ) -> Result<&'m mut [u8], CodecError> {
        region_mut(memory, address, len).ok_or(CodecError::BufferOutOfBounds { address })
    }
}
