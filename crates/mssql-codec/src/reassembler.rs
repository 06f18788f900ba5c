//! Packet reassembly from arbitrarily split transport reads.
//!
//! A transport read rarely lines up with packet boundaries. One read may end
//! in the middle of a header, another may carry the tail of one packet, two
//! whole packets, and the head of a fourth. [`PacketReassembler`] accepts
//! those reads as [`RawChunk`]s and produces complete [`Packet`]s in arrival
//! order, with nothing lost and nothing duplicated.
//!
//! ```text
//!  chunk 1          chunk 2                  chunk 3
//! [hdr|payl][hdr|pa][yload][hdr|payload][hd][r|payload]
//!  packet 1  packet 2 ...... packet 3    packet 4 .....
//! ```
//!
//! Bytes of an unfinished packet are kept verbatim in a [`PartialPacket`]
//! and completed by the next chunk.
//!
//! # Modes
//!
//! In [`ReassemblyMode::Blocking`] the caller loops on the transport until a
//! packet is complete. In [`ReassemblyMode::NonBlocking`] the caller may be
//! suspended between reads, so every completed packet is also appended to a
//! [`Snapshot`]. A resumed caller replays the snapshot instead of reading the
//! network again. The reassembly logic is the same in both modes; only the
//! snapshot differs.
//!
//! Each completed snapshot entry belongs to the message in flight. Handing
//! out an `END_OF_MESSAGE` packet, whole or by draining its view, releases
//! the entries up to and including it, so the snapshot spans at most the
//! messages not yet fully delivered.
//!
//! # Current-packet view
//!
//! [`PacketReassembler::current`] shows the oldest packet not yet handed out,
//! with its own read cursor. Packets completing behind it wait their turn, so
//! partially consumed bytes are never dropped from the view. Draining the
//! view through [`PacketReassembler::consume`] hands that packet out and moves
//! on to the next one.
//!
//! An attention packet is out-of-band: it takes over the view as soon as it
//! completes, without disturbing the cursor of the packet it covers. It is
//! still queued and snapshotted exactly once, in arrival order.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};

use crate::error::CodecError;
use crate::packet_codec::Packet;

/// A view over the bytes delivered by one transport read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk<'a> {
    buffer: &'a [u8],
    start: usize,
    length: usize,
}

impl<'a> RawChunk<'a> {
    /// View `length` bytes of `buffer` starting at `start`.
    pub fn new(buffer: &'a [u8], start: usize, length: usize) -> Result<Self, CodecError> {
        match start.checked_add(length) {
            Some(end) if end <= buffer.len() => Ok(Self {
                buffer,
                start,
                length,
            }),
            _ => Err(CodecError::InvalidChunk {
                start,
                length,
                buffer_len: buffer.len(),
            }),
        }
    }

    /// The bytes of this chunk.
    #[must_use]
    pub fn as_slice(&self) -> &'a [u8] {
        &self.buffer[self.start..self.start + self.length]
    }

    /// Number of bytes in this chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the chunk carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<'a> From<&'a [u8]> for RawChunk<'a> {
    fn from(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            start: 0,
            length: buffer.len(),
        }
    }
}

/// How the caller waits for packets. Fixed for the life of a reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReassemblyMode {
    /// The caller blocks on the transport until a packet is complete.
    #[default]
    Blocking,
    /// The caller may be suspended; completed packets are snapshotted.
    NonBlocking,
}

/// The current-packet view of a reassembler.
///
/// Holds the wire bytes of one completed packet.
/// `0 <= bytes_used <= bytes_read <= capacity` always holds.
#[derive(Debug, Clone)]
pub struct ReceiveBuffer {
    data: Bytes,
    bytes_used: usize,
    capacity: usize,
}

impl ReceiveBuffer {
    fn new(capacity: usize) -> Self {
        Self::loaded(Bytes::new(), capacity)
    }

    fn loaded(raw: Bytes, capacity: usize) -> Self {
        debug_assert!(raw.len() <= capacity);
        Self {
            data: raw,
            bytes_used: 0,
            capacity,
        }
    }

    /// Size of the buffer, fixed by the negotiated packet size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Valid bytes in the buffer.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.data.len()
    }

    /// Bytes already consumed by the caller.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.bytes_used..]
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.bytes_used == self.data.len()
    }

    /// Header of the packet in the buffer, if any.
    #[must_use]
    pub fn header(&self) -> Option<PacketHeader> {
        let mut cursor = self.data.as_ref();
        PacketHeader::decode(&mut cursor).ok()
    }

    fn consume(&mut self, n: usize) -> Result<Bytes, CodecError> {
        let available = self.data.len() - self.bytes_used;
        if n > available {
            return Err(CodecError::BufferUnderrun {
                requested: n,
                available,
            });
        }
        let start = self.bytes_used;
        self.bytes_used += n;
        Ok(self.data.slice(start..self.bytes_used))
    }
}

/// Bytes of a packet whose end has not arrived yet.
#[derive(Debug, Clone, Default)]
pub struct PartialPacket {
    bytes: BytesMut,
    expected_total_length: Option<usize>,
}

impl PartialPacket {
    /// Bytes accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing has accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Total length declared by the header, once all 8 header bytes are in.
    #[must_use]
    pub fn expected_total_length(&self) -> Option<usize> {
        self.expected_total_length
    }

    /// Whether every byte of the packet has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.expected_total_length == Some(self.bytes.len())
    }

    /// Copy as many bytes from `input` as the packet still needs.
    ///
    /// Returns the number of bytes taken.
    fn fill(&mut self, input: &[u8], capacity: usize) -> Result<usize, CodecError> {
        let mut taken = 0;

        if self.expected_total_length.is_none() {
            let want = (PACKET_HEADER_SIZE - self.bytes.len()).min(input.len());
            self.bytes.extend_from_slice(&input[..want]);
            taken = want;

            match PacketHeader::peek_length(&self.bytes) {
                Some(length) => {
                    let length = length as usize;
                    if length < PACKET_HEADER_SIZE {
                        return Err(CodecError::InvalidPacketLength { length });
                    }
                    if length > capacity {
                        return Err(CodecError::PacketTooLarge {
                            size: length,
                            max: capacity,
                        });
                    }
                    self.bytes.reserve(length - self.bytes.len());
                    self.expected_total_length = Some(length);
                }
                None => return Ok(taken),
            }
        }

        if let Some(expected) = self.expected_total_length {
            let want = (expected - self.bytes.len()).min(input.len() - taken);
            self.bytes.extend_from_slice(&input[taken..taken + want]);
            taken += want;
        }
        Ok(taken)
    }

    fn take(&mut self) -> Bytes {
        self.expected_total_length = None;
        self.bytes.split().freeze()
    }
}

/// Ordered log of packets completed in non-blocking mode.
///
/// Grows as packets complete and shrinks only from the front, when a
/// finished message is handed out. A replay cursor lets a resumed caller
/// continue where it left off; iteration always starts from the first
/// retained packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    packets: Vec<Packet>,
    /// Completion sequence of `packets[0]`.
    first_sequence: u64,
    replay_position: usize,
}

impl Snapshot {
    /// Number of logged packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether no packet has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Logged packets in completion order.
    #[must_use]
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Iterate over every logged packet from the start.
    pub fn iter(&self) -> std::slice::Iter<'_, Packet> {
        self.packets.iter()
    }

    /// Next packet at the replay cursor.
    pub fn next_replay(&mut self) -> Option<&Packet> {
        let packet = self.packets.get(self.replay_position)?;
        self.replay_position += 1;
        Some(packet)
    }

    /// Packets not yet replayed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.packets.len() - self.replay_position
    }

    /// Move the replay cursor back to the first packet.
    pub fn rewind(&mut self) {
        self.replay_position = 0;
    }

    fn append(&mut self, sequence: u64, packet: Packet) {
        if self.packets.is_empty() {
            self.first_sequence = sequence;
        }
        self.packets.push(packet);
    }

    /// Drop every entry up to and including completion `sequence`.
    fn release_through(&mut self, sequence: u64) {
        let Some(offset) = sequence.checked_sub(self.first_sequence) else {
            return;
        };
        let count = usize::try_from(offset)
            .map_or(self.packets.len(), |offset| (offset + 1).min(self.packets.len()));
        self.packets.drain(..count);
        self.first_sequence += count as u64;
        self.replay_position = self.replay_position.saturating_sub(count);
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Packet;
    type IntoIter = std::slice::Iter<'a, Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.iter()
    }
}

/// A completed packet waiting to be handed out.
#[derive(Debug)]
struct Completed {
    sequence: u64,
    packet: Packet,
    view: ReceiveBuffer,
}

/// Reassembles packets from raw transport chunks.
///
/// One instance per connection; not meant for concurrent use.
#[derive(Debug)]
pub struct PacketReassembler {
    capacity: usize,
    mode: ReassemblyMode,
    partial: PartialPacket,
    completed: VecDeque<Completed>,
    /// Attention packet covering the view, by completion sequence.
    attention: Option<(u64, ReceiveBuffer)>,
    /// View shown when nothing is waiting.
    idle: ReceiveBuffer,
    next_sequence: u64,
    snapshot: Option<Snapshot>,
}

impl PacketReassembler {
    /// Create a reassembler for packets of at most `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize, mode: ReassemblyMode) -> Self {
        let capacity = capacity.clamp(PACKET_HEADER_SIZE, MAX_PACKET_SIZE);
        Self {
            capacity,
            mode,
            partial: PartialPacket::default(),
            completed: VecDeque::new(),
            attention: None,
            idle: ReceiveBuffer::new(capacity),
            next_sequence: 0,
            snapshot: None,
        }
    }

    /// Largest packet accepted.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reassembly mode.
    #[must_use]
    pub fn mode(&self) -> ReassemblyMode {
        self.mode
    }

    /// Feed the bytes of one transport read.
    ///
    /// Returns the number of packets completed by this chunk. A header
    /// declaring fewer than 8 or more than `capacity` bytes is fatal: the
    /// stream position is lost and the connection must be dropped.
    pub fn feed(&mut self, chunk: RawChunk<'_>) -> Result<usize, CodecError> {
        let mut input = chunk.as_slice();
        let mut completed = 0;

        while !input.is_empty() {
            let taken = self.partial.fill(input, self.capacity)?;
            input = &input[taken..];

            if self.partial.is_complete() {
                let raw = self.partial.take();
                self.complete(raw)?;
                completed += 1;
            }
        }

        if !self.partial.is_empty() {
            tracing::trace!(
                buffered = self.partial.len(),
                expected = ?self.partial.expected_total_length(),
                "partial packet carried over"
            );
        }
        Ok(completed)
    }

    fn complete(&mut self, raw: Bytes) -> Result<(), CodecError> {
        let packet = Packet::from_raw(raw.clone())?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if packet.is_attention() {
            tracing::debug!(length = packet.header.length, "attention packet received");
            self.attention = Some((sequence, ReceiveBuffer::loaded(raw.clone(), self.capacity)));
        } else {
            tracing::trace!(
                packet_type = ?packet.header.packet_type,
                length = packet.header.length,
                packet_id = packet.header.packet_id,
                "packet completed"
            );
        }

        if self.mode == ReassemblyMode::NonBlocking {
            let snapshot = self.snapshot.get_or_insert_with(Snapshot::default);
            snapshot.append(sequence, packet.clone());
            tracing::trace!(entries = snapshot.len(), "snapshot append");
        }

        self.completed.push_back(Completed {
            sequence,
            packet,
            view: ReceiveBuffer::loaded(raw, self.capacity),
        });
        Ok(())
    }

    /// Take the next complete packet, if one is ready.
    ///
    /// `None` means more bytes are needed.
    pub fn try_complete_packet(&mut self) -> Option<Packet> {
        let entry = self.completed.pop_front()?;
        if self
            .attention
            .as_ref()
            .is_some_and(|(sequence, _)| *sequence == entry.sequence)
        {
            self.attention = None;
        }
        self.handed_out(&entry);
        Some(entry.packet)
    }

    /// Consume `n` bytes of the current-packet view.
    ///
    /// A packet whose last byte is consumed counts as handed out, and the
    /// view moves on to the next waiting packet.
    pub fn consume(&mut self, n: usize) -> Result<Bytes, CodecError> {
        if let Some((sequence, view)) = &mut self.attention {
            let bytes = view.consume(n)?;
            if view.is_drained() {
                let sequence = *sequence;
                self.attention = None;
                // Out of order, so its snapshot entry goes with the next message
                self.completed.retain(|entry| entry.sequence != sequence);
            }
            return Ok(bytes);
        }

        let Some(front) = self.completed.front_mut() else {
            return self.idle.consume(n);
        };
        let bytes = front.view.consume(n)?;
        if front.view.is_drained() {
            if let Some(entry) = self.completed.pop_front() {
                self.handed_out(&entry);
            }
        }
        Ok(bytes)
    }

    fn handed_out(&mut self, entry: &Completed) {
        if !entry.packet.is_end_of_message() {
            return;
        }
        if let Some(snapshot) = &mut self.snapshot {
            snapshot.release_through(entry.sequence);
            tracing::trace!(retained = snapshot.len(), "message delivered, snapshot released");
            if snapshot.is_empty() {
                self.snapshot = None;
            }
        }
    }

    /// Number of complete packets waiting to be taken.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.completed.len()
    }

    /// Whether an unfinished packet is buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    /// The unfinished packet.
    #[must_use]
    pub fn partial(&self) -> &PartialPacket {
        &self.partial
    }

    /// The current-packet view.
    ///
    /// A pending attention packet, else the oldest packet not yet handed
    /// out, else an empty view.
    #[must_use]
    pub fn current(&self) -> &ReceiveBuffer {
        if let Some((_, view)) = &self.attention {
            return view;
        }
        self.completed.front().map_or(&self.idle, |entry| &entry.view)
    }

    /// The snapshot, if non-blocking mode holds any undelivered message.
    #[must_use]
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Mutable snapshot, for replay.
    pub fn snapshot_mut(&mut self) -> Option<&mut Snapshot> {
        self.snapshot.as_mut()
    }

    /// Detach the snapshot. The next completed packet starts a new one.
    pub fn take_snapshot(&mut self) -> Option<Snapshot> {
        self.snapshot.take()
    }

    /// Discard the snapshot, ending the operation it was kept for.
    pub fn reset_snapshot(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            tracing::trace!(entries = snapshot.len(), "snapshot reset");
        }
    }
}
