#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::PacketHeader;

fuzz_target!(|data: &[u8]| {
    // Fuzz packet header parsing
    let peeked = PacketHeader::peek_length(data);
    let mut cursor = data;
    if let Ok(header) = PacketHeader::decode(&mut cursor) {
        assert_eq!(Some(header.length), peeked);
        assert!(header.payload_length() + 8 == header.length as usize);
    }
});
