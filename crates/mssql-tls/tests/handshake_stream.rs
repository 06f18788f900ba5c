//! PreLogin encapsulation tests.
//!
//! Exercises the framing of handshake traffic into PreLogin packets, the
//! unwrapping of inbound packets, the switch to pass-through, and agreement
//! between the blocking and async IO paths.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{self, Cursor, Read, Write};

use mssql_tls::{HandshakePhase, TlsError, TlsPreloginWrapper};
use proptest::prelude::*;

/// Decoded view of one wire packet.
struct WirePacket {
    packet_type: u8,
    status: u8,
    packet_id: u8,
    payload: Vec<u8>,
}

fn split_packets(mut wire: &[u8]) -> Vec<WirePacket> {
    let mut packets = Vec::new();
    while !wire.is_empty() {
        let length = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        packets.push(WirePacket {
            packet_type: wire[0],
            status: wire[1],
            packet_id: wire[6],
            payload: wire[8..length].to_vec(),
        });
        wire = &wire[length..];
    }
    packets
}

/// Frame each message through a blocking wrapper and return the wire bytes.
fn wrap_blocking(messages: &[Vec<u8>], packet_size: usize) -> Vec<u8> {
    let mut wrapper = TlsPreloginWrapper::with_packet_size(Vec::new(), packet_size);
    for message in messages {
        wrapper.write_all(message).unwrap();
    }
    wrapper.flush().unwrap();
    wrapper.into_inner()
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_large_write_split_at_packet_size() {
    let message: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
    let wire = wrap_blocking(std::slice::from_ref(&message), 512);

    let packets = split_packets(&wire);
    assert_eq!(packets.len(), 4);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.packet_type, 0x12);
        assert_eq!(packet.packet_id, i as u8 + 1);
        let last = i == packets.len() - 1;
        assert_eq!(packet.status, u8::from(last));
        if !last {
            assert_eq!(packet.payload.len(), 504);
        }
    }
    assert_eq!(packets[3].payload.len(), 2000 - 3 * 504);

    let rejoined: Vec<u8> = packets.into_iter().flat_map(|p| p.payload).collect();
    assert_eq!(rejoined, message);

    let mut unwrapped = Vec::new();
    TlsPreloginWrapper::new(Cursor::new(wire))
        .read_to_end(&mut unwrapped)
        .unwrap();
    assert_eq!(unwrapped, message);
}

#[test]
fn test_write_of_exact_payload_size_is_one_packet() {
    let wire = wrap_blocking(&[vec![7; 4088]], 4096);
    let packets = split_packets(&wire);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].status, 0x01);
    assert_eq!(wire.len(), 4096);
}

// ============================================================================
// Inbound errors
// ============================================================================

#[test]
fn test_truncated_header_is_unexpected_eof() {
    let mut wrapper = TlsPreloginWrapper::new(Cursor::new(vec![0x12, 0x01, 0x00, 0x10, 0x00]));
    let err = wrapper.read(&mut [0u8; 32]).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[test]
fn test_truncated_payload_is_unexpected_eof() {
    let mut wire = wrap_blocking(&[b"handshake".to_vec()], 4096);
    wire.truncate(wire.len() - 3);
    let mut wrapper = TlsPreloginWrapper::new(Cursor::new(wire));

    let mut out = Vec::new();
    let err = wrapper.read_to_end(&mut out).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    assert_eq!(out, b"handsh");
}

#[test]
fn test_clean_eof_between_packets() {
    let wire = wrap_blocking(&[b"abc".to_vec()], 4096);
    let mut wrapper = TlsPreloginWrapper::new(Cursor::new(wire));

    let mut buf = [0u8; 16];
    assert_eq!(wrapper.read(&mut buf).unwrap(), 3);
    assert_eq!(wrapper.read(&mut buf).unwrap(), 0);
}

// ============================================================================
// Phase switch
// ============================================================================

#[test]
fn test_finish_mid_packet_is_rejected() {
    let wire = wrap_blocking(&[vec![1; 100]], 4096);
    let mut wrapper = TlsPreloginWrapper::new(Cursor::new(wire));
    wrapper.read_exact(&mut [0u8; 40]).unwrap();

    match wrapper.finish_handshake() {
        Err(TlsError::UndrainedHandshakeData {
            read_buffered,
            write_pending,
        }) => {
            assert_eq!(read_buffered, 60);
            assert_eq!(write_pending, 0);
        }
        other => panic!("unexpected result: {other:?}"),
    }

    wrapper.read_exact(&mut [0u8; 60]).unwrap();
    wrapper.finish_handshake().unwrap();
    assert_eq!(wrapper.phase(), HandshakePhase::Finished);
}

#[test]
fn test_pass_through_after_finish() {
    let mut wire = wrap_blocking(&[b"hello".to_vec()], 4096);
    wire.extend_from_slice(b"\x17\x03\x03 encrypted");

    let mut wrapper = TlsPreloginWrapper::new(Cursor::new(wire));
    let mut hello = [0u8; 5];
    wrapper.read_exact(&mut hello).unwrap();
    assert_eq!(&hello, b"hello");

    wrapper.finish_handshake().unwrap();
    let mut rest = Vec::new();
    wrapper.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"\x17\x03\x03 encrypted");
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn wrap_then_unwrap_preserves_bytes(
        messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..3000), 1..6),
        packet_size in 9usize..2048,
        tail in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut wire = wrap_blocking(&messages, packet_size);
        for packet in split_packets(&wire) {
            prop_assert_eq!(packet.packet_type, 0x12);
            prop_assert!(packet.payload.len() + 8 <= packet_size);
        }
        wire.extend_from_slice(&tail);

        let expected: Vec<u8> = messages.concat();
        let mut wrapper = TlsPreloginWrapper::new(Cursor::new(wire));
        let mut unwrapped = vec![0u8; expected.len()];
        wrapper.read_exact(&mut unwrapped).unwrap();
        prop_assert_eq!(&unwrapped, &expected);

        wrapper.finish_handshake().unwrap();
        let mut rest = Vec::new();
        wrapper.read_to_end(&mut rest).unwrap();
        prop_assert_eq!(rest, tail);
    }
}

// ============================================================================
// Async IO
// ============================================================================

mod async_io {
    use std::io;

    use mssql_tls::{TlsConfig, TlsConnector, TlsError, TlsNegotiationMode, TlsPreloginWrapper};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::wrap_blocking;

    #[test]
    fn test_async_write_matches_blocking() {
        let messages = vec![vec![0x16; 300], Vec::new(), vec![0x14; 9000]];
        let blocking = wrap_blocking(&messages, 1024);

        let asynchronous = tokio_test::block_on(async {
            let mut wrapper = TlsPreloginWrapper::with_packet_size(Vec::new(), 1024);
            for message in &messages {
                wrapper.write_all(message).await.unwrap();
            }
            wrapper.flush().await.unwrap();
            wrapper.into_inner()
        });

        assert_eq!(asynchronous, blocking);
    }

    #[tokio::test]
    async fn test_async_read_across_split_transport_reads() {
        let message: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        let wire = wrap_blocking(std::slice::from_ref(&message), 256);

        let mut builder = tokio_test::io::Builder::new();
        for chunk in wire.chunks(37) {
            builder.read(chunk);
        }
        let mut wrapper = TlsPreloginWrapper::new(builder.build());

        let mut unwrapped = Vec::new();
        wrapper.read_to_end(&mut unwrapped).await.unwrap();
        assert_eq!(unwrapped, message);
        wrapper.finish_handshake().unwrap();
    }

    #[tokio::test]
    async fn test_async_truncated_header_is_unexpected_eof() {
        let mock = tokio_test::io::Builder::new().read(&[0x12, 0x01, 0x00]).build();
        let mut wrapper = TlsPreloginWrapper::new(mock);

        let err = wrapper.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    // ============================================================================
    // Handshake through the connector
    // ============================================================================

    fn install_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[tokio::test]
    async fn test_client_hello_travels_in_prelogin_packet() {
        install_crypto_provider();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut header = [0u8; 8];
            server.read_exact(&mut header).await.unwrap();
            let length = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut payload = vec![0u8; length - 8];
            server.read_exact(&mut payload).await.unwrap();

            // Answer with a result packet instead of a PreLogin one
            server
                .write_all(&[0x04, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00])
                .await
                .unwrap();
            (header, payload)
        });

        let connector = TlsConnector::new(TlsConfig::new().trust_server_certificate(true)).unwrap();
        let result = connector.connect_prelogin(client, "localhost").await;
        assert!(matches!(result, Err(TlsError::HandshakeFailed(_))));

        let (header, payload) = server_task.await.unwrap();
        assert_eq!(header[0], 0x12);
        assert_eq!(header[1], 0x01);
        assert_eq!(header[6], 1);
        // TLS handshake record
        assert_eq!(payload[0], 0x16);
    }

    #[tokio::test]
    async fn test_server_hangup_fails_handshake() {
        install_crypto_provider();
        let (client, server) = tokio::io::duplex(64 * 1024);
        drop(server);

        let connector = TlsConnector::new(TlsConfig::new()).unwrap();
        let result = connector.connect_prelogin(client, "localhost").await;
        assert!(matches!(result, Err(TlsError::HandshakeFailed(_))));
    }

    /// Handshake through `negotiate` and return the first bytes the server saw.
    async fn first_bytes_of_negotiation(config: TlsConfig) -> [u8; 3] {
        install_crypto_provider();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut first = [0u8; 3];
            server.read_exact(&mut first).await.unwrap();
            // Hang up mid-handshake
            drop(server);
            first
        });

        let connector = TlsConnector::new(config).unwrap();
        let result = connector.negotiate(client, "localhost").await;
        assert!(matches!(result, Err(TlsError::HandshakeFailed(_))));
        server_task.await.unwrap()
    }

    #[tokio::test]
    async fn test_negotiate_encapsulates_by_default() {
        let config = TlsConfig::new();
        install_crypto_provider();
        let connector = TlsConnector::new(config.clone()).unwrap();
        assert_eq!(connector.negotiation_mode(), TlsNegotiationMode::Encapsulated);

        let first = first_bytes_of_negotiation(config).await;
        // PreLogin header, end of message
        assert_eq!(first[..2], [0x12, 0x01]);
    }

    #[tokio::test]
    async fn test_negotiate_strict_sends_bare_tls() {
        let config = TlsConfig::new().strict_mode(true);
        install_crypto_provider();
        let connector = TlsConnector::new(config.clone()).unwrap();
        assert_eq!(connector.negotiation_mode(), TlsNegotiationMode::Strict);

        let first = first_bytes_of_negotiation(config).await;
        // TLS handshake record, major version 3
        assert_eq!(first[0], 0x16);
        assert_eq!(first[1], 0x03);
    }
}
