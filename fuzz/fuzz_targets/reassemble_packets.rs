#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use mssql_codec::{PacketReassembler, RawChunk, ReassemblyMode};

#[derive(Debug, Arbitrary)]
struct Input {
    non_blocking: bool,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    // Feed server bytes split at arbitrary read boundaries
    let mode = if input.non_blocking {
        ReassemblyMode::NonBlocking
    } else {
        ReassemblyMode::Blocking
    };
    let mut reassembler = PacketReassembler::new(4096, mode);
    let mut completed = 0;

    for chunk in &input.chunks {
        if reassembler.feed(RawChunk::from(&chunk[..])).is_err() {
            return;
        }
        while let Some(packet) = reassembler.try_complete_packet() {
            assert_eq!(packet.total_size(), packet.header.length as usize);
            completed += 1;
        }
    }

    if let Some(snapshot) = reassembler.snapshot() {
        // Delivered messages are released from the front
        assert!(snapshot.len() <= completed);
    }
});
