//! Packet streams over transports.
//!
//! - `PacketReader<T>` - async stream of packets from an `AsyncRead`
//! - `PacketWriter<T>` - async sink of packets into an `AsyncWrite`
//! - `BlockingPacketReader<R>` - the same reassembly over `std::io::Read`
//!
//! All readers feed the transport's reads into a
//! [`PacketReassembler`](crate::reassembler::PacketReassembler); they differ
//! only in how they wait for more bytes.

use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::{Sink, SinkExt};
use pin_project_lite::pin_project;
use tds_protocol::packet::PacketType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::CodecError;
use crate::packet_codec::{Packet, TdsCodec, encode_message};
use crate::reassembler::{PacketReassembler, RawChunk, ReassemblyMode};

pin_project! {
    /// A read-only packet stream for receiving TDS packets.
    pub struct PacketReader<T> {
        #[pin]
        inner: FramedRead<T, TdsCodec>,
    }
}

impl<T> PacketReader<T>
where
    T: AsyncRead,
{
    /// Create a packet reader that snapshots each message until it is
    /// fully delivered.
    pub fn new(transport: T) -> Self {
        Self::with_codec(
            transport,
            TdsCodec::new().with_mode(ReassemblyMode::NonBlocking),
        )
    }

    /// Create a new packet reader with a custom codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: FramedRead::new(transport, codec),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Get a mutable reference to the underlying transport.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &TdsCodec {
        self.inner.decoder()
    }

    /// Get a mutable reference to the codec.
    pub fn codec_mut(&mut self) -> &mut TdsCodec {
        self.inner.decoder_mut()
    }

    /// Reassembly state, including the snapshot.
    pub fn reassembler(&self) -> &PacketReassembler {
        self.inner.decoder().reassembler()
    }

    /// Mutable reassembly state, for snapshot replay.
    pub fn reassembler_mut(&mut self) -> &mut PacketReassembler {
        self.inner.decoder_mut().reassembler_mut()
    }
}

impl<T> Stream for PacketReader<T>
where
    T: AsyncRead + Unpin,
{
    type Item = Result<Packet, CodecError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T> std::fmt::Debug for PacketReader<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

pin_project! {
    /// A write-only packet sink for sending TDS packets.
    pub struct PacketWriter<T> {
        #[pin]
        inner: FramedWrite<T, TdsCodec>,
    }
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite,
{
    /// Create a new packet writer over the given transport.
    pub fn new(transport: T) -> Self {
        Self {
            inner: FramedWrite::new(transport, TdsCodec::new()),
        }
    }

    /// Create a new packet writer with a custom codec.
    pub fn with_codec(transport: T, codec: TdsCodec) -> Self {
        Self {
            inner: FramedWrite::new(transport, codec),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Get a mutable reference to the underlying transport.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &TdsCodec {
        self.inner.encoder()
    }

    /// Get a mutable reference to the codec.
    pub fn codec_mut(&mut self) -> &mut TdsCodec {
        self.inner.encoder_mut()
    }
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite + Unpin,
{
    /// Send a complete message, split into packets of the codec's size.
    ///
    /// If `reset_connection` is true, the first packet asks the server to
    /// reset session state before running the request.
    pub async fn send_message(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        reset_connection: bool,
    ) -> Result<(), CodecError> {
        let packet_size = self.codec().max_packet_size();
        let packets = encode_message(packet_type, &payload, packet_size, reset_connection);
        tracing::trace!(
            packet_type = ?packet_type,
            packets = packets.len(),
            bytes = payload.len(),
            "sending message"
        );

        for packet in packets {
            self.feed(packet).await?;
        }
        self.flush().await
    }
}

impl<T> Sink<Packet> for PacketWriter<T>
where
    T: AsyncWrite + Unpin,
{
    type Error = CodecError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Packet) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}

impl<T> std::fmt::Debug for PacketWriter<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

/// Reads packets from a blocking transport.
///
/// Each call blocks on the transport until a whole packet is available.
pub struct BlockingPacketReader<R> {
    reader: R,
    reassembler: PacketReassembler,
    buf: BytesMut,
}

impl<R: Read> BlockingPacketReader<R> {
    /// Create a reader for packets of at most `packet_size` bytes.
    pub fn new(reader: R, packet_size: usize) -> Self {
        let reassembler = PacketReassembler::new(packet_size, ReassemblyMode::Blocking);
        let buf = BytesMut::zeroed(reassembler.capacity());
        Self {
            reader,
            reassembler,
            buf,
        }
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the transport ends between packets, and
    /// [`CodecError::ConnectionClosed`] when it ends inside one.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        loop {
            if let Some(packet) = self.reassembler.try_complete_packet() {
                return Ok(Some(packet));
            }

            let n = match self.reader.read(&mut self.buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                if self.reassembler.has_partial() {
                    return Err(CodecError::ConnectionClosed);
                }
                return Ok(None);
            }

            self.reassembler.feed(RawChunk::new(&self.buf, 0, n)?)?;
        }
    }

    /// Reassembly state.
    pub fn reassembler(&self) -> &PacketReassembler {
        &self.reassembler
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Consume the reader and return the underlying transport.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for BlockingPacketReader<R> {
    type Item = Result<Packet, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_packet().transpose()
    }
}

impl<R> std::fmt::Debug for BlockingPacketReader<R>
where
    R: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPacketReader")
            .field("transport", &self.reader)
            .field("pending", &self.reassembler.pending())
            .finish()
    }
}
