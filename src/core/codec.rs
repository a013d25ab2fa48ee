//! # Wire Codec
//!
//! Accessors for the fixed fields of the session protocol.
//!
//! ## Wire Format
//! ```text
//! Sequenced packet:      [Opcode(2, BE)] [Sequence(2, BE)] [Payload(N)]
//! Combined envelope:     [0x00 0x03] { [Len(1)] [Sub-packet(Len)] }*
//! First fragment:        [0x00 0x0d] [Sequence(2, BE)] [TotalLen(4, BE)] [AppOpcode(2, LE)] [Payload]
//! Continuation fragment: [0x00 0x0d] [Sequence(2, BE)] [Payload]
//! ```
//!
//! Datagrams are never re-framed here; the proxy edits them in place, so the
//! helpers work on byte slices and hand back offsets rather than owned copies.

use std::fmt::Write as _;
use std::ops::Range;

use crate::core::opcode::{Opcode, APP_OP_SERVER_LIST_RESPONSE};
use crate::error::{constants, ProxyError, Result};

/// Datagram budget of the transport.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Size of a first-fragment header on the wire.
pub const FIRST_FRAGMENT_HEADER_LEN: usize = 10;

/// Size of a continuation-fragment header on the wire.
pub const FRAGMENT_HEADER_LEN: usize = 4;

/// Payload budget of the first fragment as used by the fragment-count formula.
///
/// The deployed formula subtracts 8 rather than [`FIRST_FRAGMENT_HEADER_LEN`];
/// it matches captured server traffic, so it is kept as-is.
pub const FIRST_FRAGMENT_PAYLOAD: i64 = (MAX_DATAGRAM_SIZE - 8) as i64;

/// Payload budget of each continuation fragment.
pub const SUBSEQUENT_FRAGMENT_PAYLOAD: i64 = (MAX_DATAGRAM_SIZE - FRAGMENT_HEADER_LEN) as i64;

fn require(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProxyError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Read the transport opcode of a datagram.
#[inline]
pub fn opcode(buf: &[u8]) -> Result<Opcode> {
    require(buf, 2)?;
    Ok(Opcode::from(u16::from_be_bytes([buf[0], buf[1]])))
}

/// Read the sequence field of a sequenced datagram.
#[inline]
pub fn sequence(buf: &[u8]) -> Result<u16> {
    require(buf, 4)?;
    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

/// Overwrite the sequence field in place.
#[inline]
pub fn set_sequence(buf: &mut [u8], seq: u16) -> Result<()> {
    require(buf, 4)?;
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    Ok(())
}

/// Iterator over the sub-packets of a Combined envelope.
///
/// Yields byte ranges into the envelope so callers can either borrow or patch
/// each sub-packet. A zero length or a length that would run past the end of the
/// envelope ends iteration; whatever was yielded before stays valid.
#[derive(Debug, Clone)]
pub struct CombinedRanges {
    len: usize,
    pos: usize,
    lengths: Vec<(usize, u8)>,
    next: usize,
}

impl CombinedRanges {
    /// Walk the length prefixes of `buf` (the whole envelope, opcode included).
    pub fn new(buf: &[u8]) -> Self {
        let mut lengths = Vec::new();
        let len = buf.len();
        let mut pos = 2;
        if len >= 4 {
            while pos < len {
                let sublen = buf[pos] as usize;
                let start = pos + 1;
                if sublen == 0 || start + sublen > len {
                    if sublen != 0 {
                        tracing::debug!(
                            offset = pos,
                            sublen,
                            envelope = len,
                            "{}",
                            constants::ERR_COMBINED_OVERRUN
                        );
                    }
                    break;
                }
                lengths.push((start, buf[pos]));
                pos = start + sublen;
            }
        }
        Self {
            len,
            pos,
            lengths,
            next: 0,
        }
    }

    /// Number of well-formed sub-packets found.
    pub fn count_valid(&self) -> usize {
        self.lengths.len()
    }

    /// Whether parsing consumed the whole envelope.
    pub fn is_complete(&self) -> bool {
        self.pos >= self.len
    }
}

impl Iterator for CombinedRanges {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let (start, sublen) = *self.lengths.get(self.next)?;
        self.next += 1;
        Some(start..start + sublen as usize)
    }
}

/// Decoded first-fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstFragmentHeader {
    pub sequence: u16,
    /// Total length of the fragmented message, converted from network order.
    pub total_len: u32,
    pub app_opcode: u16,
}

impl FirstFragmentHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIRST_FRAGMENT_HEADER_LEN {
            return Err(ProxyError::MalformedFrame(constants::ERR_SHORT_FIRST_FRAGMENT));
        }
        Ok(Self {
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            total_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            app_opcode: u16::from_le_bytes([buf[8], buf[9]]),
        })
    }

    /// Parse `buf` and keep it only if it starts a server listing.
    pub fn server_list(buf: &[u8]) -> Option<Self> {
        Self::parse(buf)
            .ok()
            .filter(|header| header.app_opcode == APP_OP_SERVER_LIST_RESPONSE)
    }

    /// Number of datagrams (first included) the message is split across.
    ///
    /// Uses floor division, so a message that fits the first fragment yields 1.
    pub fn fragment_count(&self) -> usize {
        let pieces =
            (self.total_len as i64 - FIRST_FRAGMENT_PAYLOAD).div_euclid(SUBSEQUENT_FRAGMENT_PAYLOAD) + 2;
        pieces.max(1) as usize
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&Opcode::Fragment.as_u16().to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.total_len.to_be_bytes());
        out.extend_from_slice(&self.app_opcode.to_le_bytes());
    }
}

/// Render a datagram as hex + printable ASCII, 16 bytes per row.
pub fn hex_dump(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 4);
    for row in buf.chunks(16) {
        for byte in row {
            let _ = write!(out, "{byte:02X} ");
        }
        for _ in row.len()..16 {
            out.push_str("   ");
        }
        out.push(' ');
        out.extend(row.iter().map(|&b| {
            if (32..127).contains(&b) {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
