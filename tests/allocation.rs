use sandheap::error::{HeapError, PointerFault, StringError};
use sandheap::{Config, Error, HeapStats, MemoryLayout, Module, Silent};

const ARENA_SIZE: u32 = 1024;

/// A module with a string region of 1008 bytes and a heap arena of 1024
/// bytes.
fn module() -> Module<2048> {
    let module = Module::new(Config::DEFAULT, Silent);
    module
        .write_layout(&MemoryLayout {
            str_start: 0x0010,
            str_end: 0x0400,
            heap_start: 0x0400,
            heap_end: 0x0400 + ARENA_SIZE,
        })
        .unwrap();
    module.init().unwrap();
    module
}

/// Every byte of the arena belongs to exactly one header or payload.
fn assert_covered(stats: &HeapStats) {
    assert_eq!(
        stats.used_bytes + stats.free_bytes + 16 * stats.blocks(),
        ARENA_SIZE,
        "{stats:?}"
    );
}

#[test]
fn split_and_merge() {
    let module = module();
    let ptr = module.allocate(100).unwrap();
    assert_eq!(ptr, 0x0410);
    assert_eq!(
        module.check(),
        Ok(HeapStats {
            used_blocks: 1,
            free_blocks: 1,
            used_bytes: 100,
            free_bytes: 892,
            largest_free: 892,
        })
    );

    assert_eq!(
        module.allocate(2000),
        Err(Error::Heap(HeapError::OutOfMemory { requested: 2000 }))
    );
    module.free(ptr).unwrap();
    let stats = module.check().unwrap();
    assert_eq!(stats.blocks(), 1);
    assert_eq!(stats.largest_free, 1008);
}

#[test]
fn block_of_returned_pointer() {
    let module = module();
    let ptr = module.allocate(30).unwrap();
    let block = module.block_for(ptr).unwrap();
    assert_eq!(block.payload(), ptr);
    assert_eq!(block.size, 32);
    assert!(!block.free);

    module.free(ptr).unwrap();
    assert_eq!(
        module.free(ptr),
        Err(Error::Heap(HeapError::InvalidPointer {
            address: ptr,
            fault: PointerFault::NotAllocated,
        }))
    );
}

#[test]
fn exhaustion_and_recovery() {
    let module = module();
    let mut pointers = Vec::new();
    while let Ok(ptr) = module.allocate(44) {
        pointers.push(ptr);
    }
    // 1024 bytes hold 17 blocks of 60 bytes, the last one takes the rest
    assert_eq!(pointers.len(), 17);
    assert_eq!(module.check().unwrap().free_blocks, 0);

    for ptr in pointers.iter().rev().step_by(2) {
        module.free(*ptr).unwrap();
    }
    for ptr in pointers.iter().rev().skip(1).step_by(2) {
        module.free(*ptr).unwrap();
    }
    assert_eq!(module.allocate(1008), Ok(0x0410));
}

/// A tiny deterministic generator, so the sequence is reproducible.
struct Lcg(u32);
impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.0 >> 16
    }
}

#[test]
fn mixed_sequence_keeps_payloads_intact() {
    let module = module();
    let mut random = Lcg(0x5EED);
    let mut live: Vec<(u32, u32, u8)> = Vec::new();

    for step in 0..2000u32 {
        if live.is_empty() || random.next() % 3 != 0 {
            let size = random.next() % 120;
            if let Ok(ptr) = module.allocate(size) {
                let fill = step as u8;
                module
                    .with_memory(|memory| {
                        memory[ptr as usize..(ptr + size) as usize].fill(fill);
                    })
                    .unwrap();
                live.push((ptr, size, fill));
            }
        } else {
            let index = random.next() as usize % live.len();
            let (ptr, size, fill) = live.swap_remove(index);
            module
                .with_memory(|memory| {
                    let payload = &memory[ptr as usize..(ptr + size) as usize];
                    assert!(payload.iter().all(|&byte| byte == fill), "{ptr:#x}");
                })
                .unwrap();
            module.free(ptr).unwrap();
        }

        let stats = module.check().unwrap();
        assert_covered(&stats);
        assert_eq!(stats.used_blocks as usize, live.len());
    }

    // no two live blocks share a byte
    let mut ranges: Vec<_> = live
        .iter()
        .map(|&(ptr, _, _)| {
            let block = module.block_for(ptr).unwrap();
            block.address..block.end()
        })
        .collect();
    ranges.sort_by_key(|range| range.start);
    for pair in ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{pair:?}");
    }

    for (ptr, _, _) in live {
        module.free(ptr).unwrap();
    }
    assert_eq!(module.check().unwrap().largest_free, 1008);
}

#[test]
fn strings_and_heap_are_separate() {
    let module = module();
    let ptr = module.allocate(1008).unwrap();
    module.with_memory(|memory| memory[0x0410..0x0800].fill(0xAA)).unwrap();

    let string = module.reserve_string(5).unwrap();
    assert_eq!(string, 0x0010);
    module
        .with_memory(|memory| {
            assert_eq!(&memory[0x0010..0x0016], &[0; 6]);
            memory[0x0010..0x0015].copy_from_slice(b"hello");
        })
        .unwrap();
    assert_eq!(module.reserve_string(1000), Ok(0x0016));
    assert_eq!(
        module.reserve_string(2),
        Err(Error::String(StringError::Exhausted {
            size: 2,
            remaining: 1
        }))
    );
    assert_eq!(
        module.reserve_string(2000),
        Err(Error::String(StringError::TooLarge {
            size: 2000,
            capacity: 1008
        }))
    );
    // neither region touched the other
    module
        .with_memory(|memory| assert!(memory[0x0410..0x0800].iter().all(|&b| b == 0xAA)))
        .unwrap();
    module.free(ptr).unwrap();
}

#[test]
fn codec_round_trip() {
    let module = module();
    assert_eq!(module.encode(), Err(Error::CodecUninitialized));

    let codec = module.codec_init(8).unwrap();
    assert_eq!(module.codec(), Ok(codec.clone()));
    module
        .with_memory(|memory| {
            let decoded = codec.decoded_ptr() as usize;
            memory[decoded..decoded + 8]
                .copy_from_slice(&[0x86, 0x4F, 0xD2, 0x6F, 0xB5, 0x59, 0xF7, 0x5B]);
            let size = codec.data_size_ptr() as usize;
            memory[size..size + 4].copy_from_slice(&8u32.to_le_bytes());
        })
        .unwrap();
    assert_eq!(module.padded_data_size(), Ok(8));
    assert_eq!(module.encode(), Ok(10));

    module
        .with_memory(|memory| {
            let encoded = codec.encoded_ptr() as usize;
            assert_eq!(&memory[encoded..encoded + 11], b"HelloWorld\0");
            memory[encoded..encoded + 10].copy_from_slice(b"0000000000");
        })
        .unwrap();
    assert_eq!(module.decode(), Ok(8));
    module
        .with_memory(|memory| {
            let decoded = codec.decoded_ptr() as usize;
            assert_eq!(&memory[decoded..decoded + 8], &[0; 8]);
        })
        .unwrap();
}

#[test]
fn codec_buffers_are_replaced() {
    let module = module();
    module.codec_init(100).unwrap();
    module.codec_init(200).unwrap();
    let stats = module.check().unwrap();
    assert_eq!(stats.used_blocks, 3);
    assert_covered(&stats);

    module.codec_release().unwrap();
    assert_eq!(module.check().unwrap().largest_free, 1008);
    assert_eq!(module.codec_release(), Err(Error::CodecUninitialized));
}

#[test]
fn codec_buffers_cannot_be_freed_directly() {
    let module = module();
    let codec = module.codec_init(8).unwrap();
    for address in [codec.decoded_ptr(), codec.encoded_ptr(), codec.data_size_ptr()] {
        assert_eq!(
            module.free(address),
            Err(Error::Heap(HeapError::InvalidPointer {
                address,
                fault: PointerFault::CodecBuffer,
            }))
        );
    }
    assert_eq!(module.check().unwrap().used_blocks, 3);

    // after the release they are ordinary (free) blocks again
    module.codec_release().unwrap();
    assert_eq!(
        module.free(codec.decoded_ptr()),
        Err(Error::Heap(HeapError::InvalidPointer {
            address: codec.decoded_ptr(),
            fault: PointerFault::NotAllocated,
        }))
    );
}
