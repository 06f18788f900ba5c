//! TDS PreLogin wrapper for TLS handshake.
//!
//! In TDS 7.x, the TLS handshake is wrapped inside TDS PreLogin packets.
//! This wrapper frames outgoing handshake records into PreLogin packets
//! and strips the packet headers from incoming ones. Once
//! [`TlsPreloginWrapper::finish_handshake`] is called it becomes a
//! transparent pass-through and encrypted TDS traffic flows unframed.
//!
//! The same framing state backs both the blocking (`std::io`) and the
//! asynchronous (`tokio::io`) trait implementations.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::TlsError;

/// Whether handshake traffic is still being encapsulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakePhase {
    /// Traffic is framed in PreLogin packets.
    Handshaking,
    /// Traffic passes through untouched.
    Finished,
}

/// What the next inbound read must fetch.
enum ReadStep {
    /// More header bytes.
    Header,
    /// Up to this many payload bytes.
    Payload(usize),
}

/// Inbound unwrapping state.
#[derive(Debug, Default)]
struct ReadState {
    header: [u8; PACKET_HEADER_SIZE],
    header_pos: usize,
    payload_remaining: usize,
}

impl ReadState {
    fn step(&self, want: usize) -> ReadStep {
        if self.payload_remaining > 0 {
            ReadStep::Payload(want.min(self.payload_remaining))
        } else {
            ReadStep::Header
        }
    }

    fn header_slot(&mut self) -> &mut [u8] {
        &mut self.header[self.header_pos..]
    }

    /// Account for `n` header bytes just read.
    ///
    /// Returns `Ok(false)` on a clean end of stream between packets.
    fn header_read(&mut self, n: usize) -> io::Result<bool> {
        if n == 0 {
            if self.header_pos == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended after {} of {PACKET_HEADER_SIZE} header bytes",
                    self.header_pos
                ),
            ));
        }

        self.header_pos += n;
        if self.header_pos < PACKET_HEADER_SIZE {
            return Ok(true);
        }

        let header = PacketHeader::decode(&mut &self.header[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Only PreLogin packets may carry handshake records
        if header.packet_type != PacketType::PreLogin {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expected PreLogin packet (0x12), got {:?}",
                    header.packet_type
                ),
            ));
        }

        self.header_pos = 0;
        self.payload_remaining = header.payload_length();

        tracing::trace!(
            payload = self.payload_remaining,
            packet_id = header.packet_id,
            "TLS wrapper: unwrapping PreLogin packet"
        );

        Ok(true)
    }

    fn payload_read(&mut self, n: usize) -> io::Result<()> {
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "stream ended with {} payload bytes outstanding",
                    self.payload_remaining
                ),
            ));
        }
        self.payload_remaining -= n;
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.header_pos + self.payload_remaining
    }
}

/// Outbound framing state.
#[derive(Debug)]
struct WriteState {
    pending: BytesMut,
    packet_id: u8,
    max_payload: usize,
}

impl WriteState {
    fn new(packet_size: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(packet_size),
            packet_id: 1,
            max_payload: packet_size - PACKET_HEADER_SIZE,
        }
    }

    /// Frame `data` into one or more PreLogin packets.
    ///
    /// An empty write still produces one empty end-of-message packet.
    fn frame(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.push_packet(data, true);
            return;
        }

        let mut chunks = data.chunks(self.max_payload).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            self.push_packet(chunk, last);
        }
    }

    fn push_packet(&mut self, payload: &[u8], last: bool) {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        // max_payload keeps the total within u16
        let length = (PACKET_HEADER_SIZE + payload.len()) as u16;

        PacketHeader::new(PacketType::PreLogin, status, length)
            .with_packet_id(self.packet_id)
            .encode(&mut self.pending);
        self.pending.extend_from_slice(payload);
        self.packet_id = self.packet_id.wrapping_add(1);

        tracing::trace!(length, last, "TLS wrapper: framed PreLogin packet");
    }
}

/// Wrapper for TLS streams that handles TDS packet framing during handshake.
///
/// During the TLS handshake phase, this wrapper:
/// - Wraps outgoing TLS data in TDS PreLogin packets split at the
///   configured packet size; packets the transport cannot take yet are
///   held until the next write or flush
/// - Unwraps incoming TDS PreLogin packets before passing to TLS
///
/// After [`finish_handshake`](Self::finish_handshake) it becomes a
/// transparent pass-through.
#[derive(Debug)]
pub struct TlsPreloginWrapper<S> {
    stream: S,
    phase: HandshakePhase,
    read: ReadState,
    write: WriteState,
}

impl<S> TlsPreloginWrapper<S> {
    /// Create a new wrapper using the default 4096-byte PreLogin packets.
    pub fn new(stream: S) -> Self {
        Self::with_packet_size(stream, DEFAULT_PACKET_SIZE)
    }

    /// Create a new wrapper that frames handshake data into packets of at
    /// most `packet_size` bytes including the header.
    pub fn with_packet_size(stream: S, packet_size: usize) -> Self {
        let packet_size = packet_size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE);
        Self {
            stream,
            phase: HandshakePhase::Handshaking,
            read: ReadState::default(),
            write: WriteState::new(packet_size),
        }
    }

    /// Switch to pass-through mode.
    ///
    /// Fails if called twice, or while a partially read inbound packet or
    /// unflushed outbound packets are still held by the wrapper.
    pub fn finish_handshake(&mut self) -> Result<(), TlsError> {
        if self.phase == HandshakePhase::Finished {
            return Err(TlsError::HandshakeAlreadyFinished);
        }
        if self.read.buffered() > 0 || !self.write.pending.is_empty() {
            return Err(TlsError::UndrainedHandshakeData {
                read_buffered: self.read.buffered(),
                write_pending: self.write.pending.len(),
            });
        }

        self.phase = HandshakePhase::Finished;
        tracing::debug!(
            packets_sent = self.write.packet_id.wrapping_sub(1),
            "PreLogin encapsulation finished, switching to pass-through"
        );
        Ok(())
    }

    /// Current phase of the wrapper.
    #[must_use]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Maximum size of the PreLogin packets this wrapper writes.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.write.max_payload + PACKET_HEADER_SIZE
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

// =============================================================================
// Blocking IO
// =============================================================================

impl<S: Read> Read for TlsPreloginWrapper<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.phase == HandshakePhase::Finished {
            return self.stream.read(buf);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            match self.read.step(buf.len()) {
                ReadStep::Header => {
                    let n = self.stream.read(self.read.header_slot())?;
                    if !self.read.header_read(n)? {
                        return Ok(0);
                    }
                }
                ReadStep::Payload(want) => {
                    let n = self.stream.read(&mut buf[..want])?;
                    self.read.payload_read(n)?;
                    return Ok(n);
                }
            }
        }
    }
}

impl<S: Write> TlsPreloginWrapper<S> {
    fn drain(&mut self) -> io::Result<()> {
        while !self.write.pending.is_empty() {
            let n = self.stream.write(&self.write.pending)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.write.pending.advance(n);
        }
        Ok(())
    }
}

impl<S: Write> Write for TlsPreloginWrapper<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.phase == HandshakePhase::Finished {
            return self.stream.write(buf);
        }

        // Earlier packets go first; nothing is accepted if they cannot
        self.drain()?;
        self.write.frame(buf);
        match self.drain() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.stream.flush()
    }
}

// =============================================================================
// Async IO
// =============================================================================

impl<S: AsyncRead + Unpin> AsyncRead for TlsPreloginWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // After handshake, pass through directly
        if this.phase == HandshakePhase::Finished {
            return Pin::new(&mut this.stream).poll_read(cx, buf);
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.read.step(buf.remaining()) {
                ReadStep::Header => {
                    let mut header_buf = ReadBuf::new(this.read.header_slot());
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut header_buf))?;
                    let n = header_buf.filled().len();
                    if !this.read.header_read(n)? {
                        return Poll::Ready(Ok(()));
                    }
                }
                ReadStep::Payload(want) => {
                    let mut payload_buf = ReadBuf::new(buf.initialize_unfilled_to(want));
                    ready!(Pin::new(&mut this.stream).poll_read(cx, &mut payload_buf))?;
                    let n = payload_buf.filled().len();
                    this.read.payload_read(n)?;
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> TlsPreloginWrapper<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.write.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsPreloginWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // After handshake, pass through directly
        if this.phase == HandshakePhase::Finished {
            return Pin::new(&mut this.stream).poll_write(cx, buf);
        }

        // Earlier packets go first; nothing is accepted if they cannot
        ready!(this.poll_drain(cx))?;
        this.write.frame(buf);
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}
