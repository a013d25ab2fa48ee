//! # Sequence Engine
//!
//! Keeps the two sequence spaces of a proxied session apart.
//!
//! The server numbers its packets in its own space; the client only ever sees
//! numbers the proxy stamps (`seq_to_local`). Because the proxy swallows the
//! fragments of the server listing and emits one rewritten packet in their place,
//! the two spaces drift apart and every server packet has to be re-stamped.
//!
//! Incoming server packets are recorded in a slot buffer indexed by
//! `seq - seq_from_remote_offset`. Presence of a slot is what tells the engine a
//! sequence number has arrived. When the expected number shows up, the engine
//! walks forward over contiguous slots; a first fragment of the server listing
//! found on the way (or arriving directly) starts reassembly, and a complete
//! reassembly is run through the [`ServerListFilter`] and rebases the buffer so
//! it never grows for the life of a session.

use tracing::{debug, instrument, trace};

use crate::core::codec::{
    self, CombinedRanges, FirstFragmentHeader, FIRST_FRAGMENT_HEADER_LEN, FRAGMENT_HEADER_LEN,
};
use crate::core::opcode::Opcode;
use crate::error::{constants, ProxyError, Result};
use crate::protocol::listing::{FilteredListing, ServerListFilter};

/// Slots kept ahead of the baseline. A packet beyond them is forwarded unbuffered.
pub const MAX_PENDING_SLOTS: usize = 4096;

#[derive(Debug, Clone, Default)]
struct Slot {
    is_fragment: bool,
    payload: Option<Vec<u8>>,
}

/// What a server datagram turned into.
#[derive(Debug, Default)]
pub struct ServerDispatch {
    /// Buffers to send to the client, in order.
    pub outbound: Vec<Vec<u8>>,
    /// The server accepted a session (state was reset).
    pub session_accepted: bool,
    /// The server closed the session (state was reset).
    pub session_closed: bool,
    /// Server listings rewritten while handling this datagram.
    pub listings: Vec<ListingSummary>,
    /// Sub-packets that could not be processed.
    pub dropped: usize,
}

/// Counts from one rewritten server listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSummary {
    pub seen: usize,
    pub retained: usize,
}

/// Per-session sequence bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SequenceState {
    slots: Vec<Slot>,
    count: usize,
    seq_to_local: u16,
    seq_from_remote: u16,
    seq_from_remote_offset: u16,
    frag_start: u16,
    frag_count: usize,
}

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole state with a fresh one.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn seq_to_local(&self) -> u16 {
        self.seq_to_local
    }

    pub fn seq_from_remote(&self) -> u16 {
        self.seq_from_remote
    }

    pub fn seq_from_remote_offset(&self) -> u16 {
        self.seq_from_remote_offset
    }

    pub fn frag_start(&self) -> u16 {
        self.frag_start
    }

    pub fn frag_count(&self) -> usize {
        self.frag_count
    }

    pub fn is_assembling(&self) -> bool {
        self.frag_count > 0
    }

    /// Number of slots currently holding a payload.
    pub fn pending_slots(&self) -> usize {
        self.slots[..self.count]
            .iter()
            .filter(|slot| slot.payload.is_some())
            .count()
    }

    /// Whether the state is indistinguishable from a fresh one.
    pub fn is_pristine(&self) -> bool {
        self.count == 0
            && self.seq_to_local == 0
            && self.seq_from_remote == 0
            && self.seq_from_remote_offset == 0
            && self.frag_count == 0
    }

    /// Sequence number to put in a client Ack before it goes to the server.
    pub fn ack_sequence(&self) -> u16 {
        self.seq_from_remote.saturating_sub(1)
    }

    /// Handle one datagram from the server.
    pub fn handle_server_datagram(&mut self, buf: &[u8], filter: &ServerListFilter) -> ServerDispatch {
        let mut dispatch = ServerDispatch::default();
        self.dispatch(buf, filter, &mut dispatch);
        dispatch
    }

    fn dispatch(&mut self, buf: &[u8], filter: &ServerListFilter, out: &mut ServerDispatch) {
        let result = match codec::opcode(buf) {
            Ok(Opcode::SessionResponse) => {
                debug!("Session accepted by server, resetting sequence state");
                self.reset();
                out.session_accepted = true;
                out.outbound.push(buf.to_vec());
                Ok(())
            }
            Ok(Opcode::SessionDisconnect) => {
                debug!("Session closed by server, resetting sequence state");
                self.reset();
                out.session_closed = true;
                out.outbound.push(buf.to_vec());
                Ok(())
            }
            Ok(Opcode::Combined) => {
                for range in CombinedRanges::new(buf) {
                    self.dispatch(&buf[range], filter, out);
                }
                Ok(())
            }
            Ok(Opcode::Packet) => self.on_packet(buf, filter, out),
            Ok(Opcode::Fragment) => self.on_fragment(buf, filter, out),
            Ok(Opcode::Ack) => {
                trace!("Swallowing server ack");
                Ok(())
            }
            Ok(_) => {
                out.outbound.push(buf.to_vec());
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            debug!(error = %e, bytes = buf.len(), "Dropping server sub-packet");
            out.dropped += 1;
        }
    }

    #[instrument(level = "trace", skip_all, fields(seq_from_remote = self.seq_from_remote))]
    fn on_packet(&mut self, pkt: &[u8], filter: &ServerListFilter, out: &mut ServerDispatch) -> Result<()> {
        let seq = codec::sequence(pkt)?;
        let index = self.window_index(seq)?;
        if let Some(index) = index {
            self.store(index, false, pkt);
        }

        let mut forwarded = pkt.to_vec();
        codec::set_sequence(&mut forwarded, self.seq_to_local)?;
        trace!(seq, seq_to_local = self.seq_to_local, "Re-stamped server packet");
        self.seq_to_local = self.seq_to_local.wrapping_add(1);
        out.outbound.push(forwarded);

        let Some(index) = index else {
            debug!(seq, offset = self.seq_from_remote_offset, "Packet beyond reorder window, forwarded unbuffered");
            return Ok(());
        };
        if seq != self.seq_from_remote {
            trace!(seq, "Packet ahead of expected sequence, buffered");
            return Ok(());
        }

        let mut i = index;
        while i < self.count {
            let Some(payload) = self.slots[i].payload.as_deref() else {
                break;
            };
            self.seq_from_remote = self.seq_from_remote.wrapping_add(1);
            if self.slots[i].is_fragment {
                if let Some(header) = FirstFragmentHeader::server_list(payload) {
                    self.begin_fragment(header);
                    self.complete_into(filter, out)?;
                    break;
                }
            }
            i += 1;
        }
        Ok(())
    }

    #[instrument(level = "trace", skip_all, fields(seq_from_remote = self.seq_from_remote))]
    fn on_fragment(&mut self, frag: &[u8], filter: &ServerListFilter, out: &mut ServerDispatch) -> Result<()> {
        let seq = codec::sequence(frag)?;
        let index = self
            .window_index(seq)?
            .ok_or(ProxyError::MalformedFrame(constants::ERR_OUTSIDE_WINDOW))?;
        self.store(index, true, frag);

        if seq == self.seq_from_remote && !self.is_continuation(seq) {
            match FirstFragmentHeader::server_list(frag) {
                Some(header) => self.begin_fragment(header),
                None => debug!(seq, "Fragment at expected sequence does not start a server listing"),
            }
        }
        if self.frag_count > 0 {
            self.complete_into(filter, out)?;
        }
        Ok(())
    }

    fn complete_into(&mut self, filter: &ServerListFilter, out: &mut ServerDispatch) -> Result<()> {
        if let Some(listing) = self.try_complete(filter)? {
            out.listings.push(ListingSummary {
                seen: listing.seen,
                retained: listing.retained,
            });
            out.outbound.push(listing.packet);
        }
        Ok(())
    }

    /// Whether `seq` is a later piece of the message being reassembled.
    fn is_continuation(&self, seq: u16) -> bool {
        self.frag_count > 0
            && seq > self.frag_start
            && ((seq - self.frag_start) as usize) < self.frag_count
    }

    fn slot_index(&self, seq: u16) -> Result<usize> {
        if seq < self.seq_from_remote_offset {
            return Err(ProxyError::StaleSequence {
                seq,
                offset: self.seq_from_remote_offset,
            });
        }
        let index = (seq - self.seq_from_remote_offset) as usize;
        if index >= MAX_PENDING_SLOTS {
            return Err(ProxyError::MalformedFrame(constants::ERR_OUTSIDE_WINDOW));
        }
        Ok(index)
    }

    /// Slot for an arriving `seq`, sliding the window first if it is full.
    /// `None` means `seq` is still too far ahead to buffer.
    fn window_index(&mut self, seq: u16) -> Result<Option<usize>> {
        match self.slot_index(seq) {
            Ok(index) => return Ok(Some(index)),
            Err(e @ ProxyError::StaleSequence { .. }) => return Err(e),
            Err(_) => {}
        }
        self.slide();
        Ok(self.slot_index(seq).ok())
    }

    /// Drop the slots below the oldest one still needed.
    fn slide(&mut self) {
        let base = if self.frag_count > 0 {
            self.frag_start
        } else {
            self.seq_from_remote
        };
        let shift = base.saturating_sub(self.seq_from_remote_offset) as usize;
        if shift == 0 {
            return;
        }
        self.slots.drain(..shift.min(self.slots.len()));
        self.count = self.count.saturating_sub(shift);
        self.seq_from_remote_offset = base;
        debug!(offset = base, "Reorder window advanced");
    }

    fn store(&mut self, index: usize, is_fragment: bool, payload: &[u8]) {
        if index >= self.count {
            self.count = index + 1;
        }
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }
        self.slots[index] = Slot {
            is_fragment,
            payload: Some(payload.to_vec()),
        };
    }

    fn begin_fragment(&mut self, header: FirstFragmentHeader) {
        self.frag_start = header.sequence;
        self.frag_count = header.fragment_count();
        debug!(
            frag_start = self.frag_start,
            frag_count = self.frag_count,
            total_len = header.total_len,
            "Server listing reassembly started"
        );
    }

    /// Reassemble and filter the listing if every piece is present.
    fn try_complete(&mut self, filter: &ServerListFilter) -> Result<Option<FilteredListing>> {
        let start = self.slot_index(self.frag_start)?;
        let Some(first) = self.slots.get(start).and_then(|s| s.payload.as_deref()) else {
            return Ok(None);
        };

        let mut got = first.len() as isize - FIRST_FRAGMENT_HEADER_LEN as isize + 2;
        for k in 1..self.frag_count {
            let index = start + k;
            if index >= self.count {
                return Ok(None);
            }
            let Some(piece) = self.slots[index].payload.as_deref() else {
                return Ok(None);
            };
            got += piece.len() as isize - FRAGMENT_HEADER_LEN as isize;
        }
        let total_len = (got - 2).max(0) as usize;

        let result = self
            .concat_fragments(start, total_len)
            .and_then(|blob| filter.rewrite(&blob, total_len, self.seq_to_local));
        if result.is_ok() {
            self.seq_to_local = self.seq_to_local.wrapping_add(1);
        }
        debug!(
            frag_start = self.frag_start,
            frag_count = self.frag_count,
            total_len,
            "Server listing reassembled"
        );
        self.rebase();
        result.map(Some)
    }

    /// Payloads of `frag_count` slots from `start`, headers stripped.
    fn concat_fragments(&self, start: usize, capacity: usize) -> Result<Vec<u8>> {
        let mut blob = Vec::with_capacity(capacity);
        for k in 0..self.frag_count {
            let piece = self.slots[start + k]
                .payload
                .as_deref()
                .ok_or(ProxyError::MalformedFrame(constants::ERR_MISSING_FRAGMENT))?;
            // A retransmitted packet can overwrite a fragment slot with something shorter.
            let body = if k == 0 {
                piece
                    .get(FIRST_FRAGMENT_HEADER_LEN..)
                    .ok_or(ProxyError::MalformedFrame(constants::ERR_SHORT_FIRST_FRAGMENT))?
            } else {
                piece
                    .get(FRAGMENT_HEADER_LEN..)
                    .ok_or(ProxyError::MalformedFrame(constants::ERR_SHORT_FRAGMENT))?
            };
            blob.extend_from_slice(body);
        }
        Ok(blob)
    }

    fn rebase(&mut self) {
        self.seq_from_remote = self.frag_start.wrapping_add(1);
        self.seq_from_remote_offset = self.seq_from_remote;
        self.frag_count = 0;
        self.frag_start = 0;
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
        self.count = 0;
    }
}
