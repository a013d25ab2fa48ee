//! # Server Listing Filter
//!
//! Rewrites the reassembled server directory so the client only sees servers
//! whose names start with an allow-listed prefix.
//!
//! ## Blob Layout
//! ```text
//! [Header(16)] [OriginalCount(4)] { Entry }*
//!
//! Entry: [Ip\0] [ListId(4)] [RuntimeId(4)] [Name\0] [Language\0] [Region\0] [Status(4)] [Players(4)]
//! ```
//!
//! ## Output Packet
//! ```text
//! [0x00 0x09] [Sequence(2, BE)] [0x18 0x00] [Header(16)] [Count(4, LE)] { Entry }*
//! ```
//!
//! Entries are copied byte-for-byte; nothing about them is re-encoded.

use bytes::{BufMut, BytesMut};
use tracing::{debug, instrument};

use crate::core::opcode::{Opcode, APP_OP_SERVER_LIST_RESPONSE};
use crate::error::{constants, ProxyError, Result};

/// Bytes of opaque header copied verbatim into the rewritten listing.
pub const LISTING_HEADER_LEN: usize = 16;

/// Offset of the first directory entry in the reassembled blob.
pub const FIRST_ENTRY_OFFSET: usize = 20;

const INT_LEN: usize = 4;

/// Prefixes the reference deployment keeps.
pub const DEFAULT_ALLOWED_PREFIXES: [&str; 2] = ["project 1999", "an interesting"];

/// One server listing, borrowed from the reassembled blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry<'a> {
    pub raw: &'a [u8],
    pub ip: &'a [u8],
    pub list_id: i32,
    pub runtime_id: i32,
    pub name: &'a [u8],
    pub language: &'a [u8],
    pub region: &'a [u8],
    pub status: i32,
    pub player_count: i32,
}

/// Walks directory entries until the declared length is consumed.
///
/// An entry whose strings or integers would run past the end of the blob ends
/// the walk; entries already yielded are unaffected.
pub struct DirectoryEntries<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> DirectoryEntries<'a> {
    pub fn new(blob: &'a [u8], total_len: usize) -> Self {
        let blob = &blob[..total_len.min(blob.len())];
        Self {
            blob,
            pos: FIRST_ENTRY_OFFSET,
        }
    }

    fn cstr(&mut self) -> Option<&'a [u8]> {
        let rest = self.blob.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        self.pos += end + 1;
        Some(&rest[..end])
    }

    fn int(&mut self) -> Option<i32> {
        let bytes = self.blob.get(self.pos..self.pos + INT_LEN)?;
        self.pos += INT_LEN;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn entry(&mut self) -> Option<DirectoryEntry<'a>> {
        let start = self.pos;
        let ip = self.cstr()?;
        let list_id = self.int()?;
        let runtime_id = self.int()?;
        let name = self.cstr()?;
        let language = self.cstr()?;
        let region = self.cstr()?;
        let status = self.int()?;
        let player_count = self.int()?;
        Some(DirectoryEntry {
            raw: &self.blob[start..self.pos],
            ip,
            list_id,
            runtime_id,
            name,
            language,
            region,
            status,
            player_count,
        })
    }
}

impl<'a> Iterator for DirectoryEntries<'a> {
    type Item = DirectoryEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.blob.len() {
            return None;
        }
        let entry = self.entry();
        if entry.is_none() {
            debug!(offset = self.pos, len = self.blob.len(), "{}", constants::ERR_LISTING_TRUNCATED);
            self.pos = self.blob.len();
        }
        entry
    }
}

/// Case-insensitive name-prefix allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerListFilter {
    prefixes: Vec<Vec<u8>>,
    retain_all: bool,
}

impl Default for ServerListFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_PREFIXES)
    }
}

impl ServerListFilter {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.as_ref().as_bytes().to_ascii_lowercase())
                .collect(),
            retain_all: false,
        }
    }

    /// Filter that keeps every entry but still repacks the listing.
    pub fn retain_all() -> Self {
        Self {
            prefixes: Vec::new(),
            retain_all: true,
        }
    }

    pub fn is_allowed(&self, name: &[u8]) -> bool {
        if self.retain_all {
            return true;
        }
        let name = name.to_ascii_lowercase();
        self.prefixes.iter().any(|prefix| name.starts_with(prefix))
    }

    /// Build the single outgoing listing packet from a reassembled blob.
    ///
    /// `seq` is the client-facing sequence number to stamp on the packet.
    #[instrument(level = "debug", skip(self, blob), fields(blob_len = blob.len()))]
    pub fn rewrite(&self, blob: &[u8], total_len: usize, seq: u16) -> Result<FilteredListing> {
        let total_len = total_len.min(blob.len());
        if total_len < LISTING_HEADER_LEN {
            return Err(ProxyError::MalformedFrame(constants::ERR_LISTING_HEADER));
        }

        let mut seen = 0usize;
        let mut retained = 0u32;
        let mut entries = BytesMut::with_capacity(total_len);
        for entry in DirectoryEntries::new(blob, total_len) {
            seen += 1;
            if self.is_allowed(entry.name) {
                retained += 1;
                entries.put_slice(entry.raw);
            } else {
                debug!(name = %String::from_utf8_lossy(entry.name), "Dropping server listing");
            }
        }

        let mut packet = BytesMut::with_capacity(6 + LISTING_HEADER_LEN + 4 + entries.len());
        packet.put_u16(Opcode::Packet.as_u16());
        packet.put_u16(seq);
        packet.put_u16_le(APP_OP_SERVER_LIST_RESPONSE);
        packet.put_slice(&blob[..LISTING_HEADER_LEN]);
        packet.put_u32_le(retained);
        packet.put_slice(&entries);

        debug!(seen, retained, seq, "Server listing rewritten");
        Ok(FilteredListing {
            packet: packet.to_vec(),
            seen,
            retained: retained as usize,
        })
    }
}

/// Result of rewriting one server listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredListing {
    pub packet: Vec<u8>,
    pub seen: usize,
    pub retained: usize,
}
