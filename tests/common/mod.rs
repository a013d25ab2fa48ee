//! Datagram builders shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use login_proxy::core::codec::{
    FirstFragmentHeader, FIRST_FRAGMENT_HEADER_LEN, FRAGMENT_HEADER_LEN, MAX_DATAGRAM_SIZE,
};
use login_proxy::core::opcode::APP_OP_SERVER_LIST_RESPONSE;
use login_proxy::protocol::login::{
    Credentials, LoginCipher, LOGIN_CIPHERTEXT_OFFSET, LOGIN_LENGTH_OFFSET, LOGIN_MAGIC,
};

pub const KEY: [u8; 8] = [0x13, 0x37, 0xc0, 0xde, 0x42, 0x00, 0xbe, 0xef];
pub const IV: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

pub fn cipher() -> LoginCipher {
    LoginCipher::new(KEY, IV)
}

pub fn packet(seq: u16, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x09];
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn ack(seq: u16) -> Vec<u8> {
    let mut out = vec![0x00, 0x15];
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

pub fn combined(subs: &[&[u8]]) -> Vec<u8> {
    let mut out = vec![0x00, 0x03];
    for sub in subs {
        out.push(sub.len() as u8);
        out.extend_from_slice(sub);
    }
    out
}

pub fn entry(ip: &str, name: &str, players: i32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ip.as_bytes());
    out.push(0);
    out.extend_from_slice(&7i32.to_le_bytes());
    out.extend_from_slice(&9i32.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(b"EN\0US\0");
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&players.to_le_bytes());
    out
}

/// Reassembled listing: 16-byte header, 4-byte count, entries.
pub fn listing(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut out: Vec<u8> = (0xA0u8..0xB0).collect();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        out.extend_from_slice(e);
    }
    out
}

/// Pad `blob` with NUL-free filler so it splits into exactly `pieces` fragments.
pub fn pad_for_fragments(mut blob: Vec<u8>, pieces: usize) -> Vec<u8> {
    let first = MAX_DATAGRAM_SIZE - FIRST_FRAGMENT_HEADER_LEN;
    let rest = MAX_DATAGRAM_SIZE - FRAGMENT_HEADER_LEN;
    let target = first + pieces.saturating_sub(2) * rest + rest / 2;
    assert!(blob.len() <= target, "listing too large for {pieces} fragments");
    blob.resize(target, 0xFF);
    blob
}

/// Split a listing into a first fragment plus continuations starting at `start_seq`.
pub fn fragments(start_seq: u16, blob: &[u8]) -> Vec<Vec<u8>> {
    let header = FirstFragmentHeader {
        sequence: start_seq,
        total_len: (blob.len() + 2) as u32,
        app_opcode: APP_OP_SERVER_LIST_RESPONSE,
    };
    let first_len = (MAX_DATAGRAM_SIZE - FIRST_FRAGMENT_HEADER_LEN).min(blob.len());
    let mut first = Vec::new();
    header.write(&mut first);
    first.extend_from_slice(&blob[..first_len]);

    let mut out = vec![first];
    for (k, chunk) in blob[first_len..]
        .chunks(MAX_DATAGRAM_SIZE - FRAGMENT_HEADER_LEN)
        .enumerate()
    {
        let mut piece = vec![0x00, 0x0d];
        piece.extend_from_slice(&(start_seq + 1 + k as u16).to_be_bytes());
        piece.extend_from_slice(chunk);
        out.push(piece);
    }
    assert_eq!(out.len(), header.fragment_count());
    out
}

/// A login request envelope carrying `user`/`pass`.
pub fn login_datagram(cipher: &LoginCipher, user: &str, pass: &str) -> Vec<u8> {
    let creds = Credentials::new(user, pass).unwrap();
    let ciphertext = cipher.encrypt_credentials(&creds).unwrap();
    let mut buf = LOGIN_MAGIC.to_vec();
    buf.resize(LOGIN_CIPHERTEXT_OFFSET, 0);
    buf.extend_from_slice(&ciphertext);
    buf[LOGIN_LENGTH_OFFSET] = (buf.len() - 8) as u8;
    buf
}

pub fn is_listing(buf: &[u8]) -> bool {
    buf.len() >= 26 && buf[..2] == [0x00, 0x09] && buf[4..6] == [0x18, 0x00]
}
