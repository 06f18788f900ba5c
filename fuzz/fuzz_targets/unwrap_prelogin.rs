#![no_main]

use std::io::{Cursor, Read};

use libfuzzer_sys::fuzz_target;
use mssql_tls::TlsPreloginWrapper;

fuzz_target!(|data: &[u8]| {
    // Fuzz unwrapping of server handshake packets
    let mut wrapper = TlsPreloginWrapper::new(Cursor::new(data));
    let mut out = Vec::new();
    if wrapper.read_to_end(&mut out).is_ok() {
        assert!(out.len() <= data.len());
        let _ = wrapper.finish_handshake();
    }
});
