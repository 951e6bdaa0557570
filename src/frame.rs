//! Frame codec for the tunnel wire protocol
//!
//! Every POST body (request or response) is an *envelope*: a sequence of
//! length-prefixed encrypted frames ending with a sentinel frame whose
//! sequence number is zero.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------+---------------------------------------------+
//! | Length (4B BE) | Ciphertext (AES-128-CTR)                    |
//! +----------------+---------------------------------------------+
//!
//! plaintext: idx (4B BE) | connIdx (8B BE) | options (2B BE)
//!          | data_len (4B BE) | data
//! ```
//!
//! The CTR IV is the frame's length prefix repeated four times, so a parser
//! needs nothing beyond the bytes already on the wire. Frames carry no MAC;
//! structural validation (`data_len` must match the ciphertext length)
//! rejects garbage, and possession of the shared key is the only
//! authentication this transport offers.

use aes::Aes128;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::Rng;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// The frame carries no data; it declares that the next chained frames in
/// the same envelope belong to the connection named here.
pub const OPT_SYNC_CONN_IDX: u16 = 1 << 0;

/// The frame's `idx` is a counter checkpoint, not payload; the first
/// subsequent frame must begin at this value.
pub const OPT_SYNC_CTR: u16 = 1 << 1;

/// First-contact frame; the server allocates a new virtual connection with
/// this `conn_idx`.
pub const OPT_HELLO: u16 = 1 << 2;

/// The peer has closed its side of the connection.
pub const OPT_CLOSED: u16 = 1 << 3;

/// The envelope is an orchestrator poll; `data` is a concatenation of
/// 4-byte connection identifiers being polled.
pub const OPT_PING: u16 = 1 << 4;

/// Fixed plaintext header size: idx + connIdx + options + data_len.
const HEADER_LEN: usize = 4 + 8 + 2 + 4;

/// Upper bound on a single frame's ciphertext; anything larger is rejected
/// before allocation.
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Padding appended to the network name before truncating to the AES-128
/// key size.
const KEY_PAD: &[u8] = b"0123456789abcdef";

/// One frame of the tunnel protocol.
///
/// `idx` is the monotonic per-connection sequence number for payload
/// frames; zero is reserved for the envelope sentinel, and control-only
/// frames use an arbitrary nonzero value where sequencing is irrelevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub idx: u32,
    pub conn_idx: u64,
    pub options: u16,
    pub data: Bytes,
}

impl Frame {
    /// A control frame with a random nonzero sequence number.
    pub fn control(conn_idx: u64, options: u16) -> Self {
        Self {
            idx: rand::thread_rng().gen_range(1..u32::MAX),
            conn_idx,
            options,
            data: Bytes::new(),
        }
    }

    /// A payload frame at a specific position in the stream.
    pub fn payload(idx: u32, conn_idx: u64, data: Bytes) -> Self {
        Self {
            idx,
            conn_idx,
            options: 0,
            data,
        }
    }

    /// The end-of-chain sentinel.
    pub fn terminator() -> Self {
        Self {
            idx: 0,
            conn_idx: 0,
            options: 0,
            data: Bytes::new(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.idx == 0
    }
}

/// AES-128 key shared by every frame of one dialer/listener.
#[derive(Clone, Copy)]
pub struct FrameCipher {
    key: [u8; 16],
}

impl FrameCipher {
    /// Derive the cipher key from a user-supplied network name: the name is
    /// padded with the literal `0123456789abcdef` and truncated to 16 bytes.
    pub fn new(network: &str) -> Self {
        let mut padded = network.as_bytes().to_vec();
        padded.extend_from_slice(KEY_PAD);
        let mut key = [0u8; 16];
        key.copy_from_slice(&padded[..16]);
        Self { key }
    }

    /// Apply the CTR keystream in place. Encryption and decryption are the
    /// same operation.
    fn apply(&self, frame_len: u32, buf: &mut [u8]) {
        let len_bytes = frame_len.to_be_bytes();
        let mut iv = [0u8; 16];
        for chunk in iv.chunks_exact_mut(4) {
            chunk.copy_from_slice(&len_bytes);
        }
        let mut ctr = Aes128Ctr::new(&self.key.into(), &iv.into());
        ctr.apply_keystream(buf);
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCipher(..)")
    }
}

/// Append one encrypted frame to `out`.
pub fn write_frame(out: &mut BytesMut, f: &Frame, cipher: &FrameCipher) {
    let len = (HEADER_LEN + f.data.len()) as u32;
    out.put_u32(len);

    let start = out.len();
    out.put_u32(f.idx);
    out.put_u64(f.conn_idx);
    out.put_u16(f.options);
    out.put_u32(f.data.len() as u32);
    out.put_slice(&f.data);
    cipher.apply(len, &mut out[start..]);
}

/// Append the end-of-chain sentinel to `out`.
pub fn write_terminator(out: &mut BytesMut, cipher: &FrameCipher) {
    write_frame(out, &Frame::terminator(), cipher);
}

/// Serialize a chain of frames into one envelope, sentinel included.
pub fn marshal_chain(frames: &[Frame], cipher: &FrameCipher) -> Bytes {
    let mut out = BytesMut::with_capacity(
        frames
            .iter()
            .map(|f| 4 + HEADER_LEN + f.data.len())
            .sum::<usize>()
            + 4
            + HEADER_LEN,
    );
    for f in frames {
        write_frame(&mut out, f, cipher);
    }
    write_terminator(&mut out, cipher);
    out.freeze()
}

/// Read one frame off the source.
///
/// Returns `None` on any structural inconsistency (truncated input,
/// oversized length, or a `data_len` that disagrees with the ciphertext
/// length). The sentinel is returned as a normal frame with `idx == 0` so
/// the caller can stop.
pub fn parse_frame(src: &mut impl Buf, cipher: &FrameCipher) -> Option<Frame> {
    if src.remaining() < 4 {
        return None;
    }
    let len = src.get_u32();
    let frame_len = len as usize;
    if frame_len < HEADER_LEN || frame_len > MAX_FRAME_SIZE || src.remaining() < frame_len {
        return None;
    }

    let mut plain = vec![0u8; frame_len];
    src.copy_to_slice(&mut plain);
    cipher.apply(len, &mut plain);

    let mut hdr = &plain[..HEADER_LEN];
    let idx = hdr.get_u32();
    let conn_idx = hdr.get_u64();
    let options = hdr.get_u16();
    let data_len = hdr.get_u32() as usize;
    if data_len != frame_len - HEADER_LEN {
        return None;
    }

    let mut data = Bytes::from(plain);
    data.advance(HEADER_LEN);
    Some(Frame {
        idx,
        conn_idx,
        options,
        data,
    })
}

/// Parse a whole envelope up front.
///
/// Returns the frames preceding the sentinel, or `None` if any frame is
/// malformed or the chain is not terminated. Used by the server handler,
/// which must reject a request before acting on any part of it.
pub fn parse_chain(src: &mut impl Buf, cipher: &FrameCipher) -> Option<Vec<Frame>> {
    let mut frames = Vec::new();
    loop {
        let f = parse_frame(src, cipher)?;
        if f.is_terminator() {
            return Some(frames);
        }
        frames.push(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> FrameCipher {
        FrameCipher::new("net1")
    }

    #[test]
    fn test_key_derivation() {
        assert_eq!(&FrameCipher::new("net1").key, b"net10123456789ab");
        // Long names are truncated to the key size.
        assert_eq!(
            &FrameCipher::new("a-rather-long-network-name").key,
            b"a-rather-long-ne"
        );
        assert_eq!(&FrameCipher::new("").key, b"0123456789abcdef");
    }

    #[test]
    fn test_frame_roundtrip() {
        let f = Frame::payload(7, 0xdead_beef_cafe_f00d, Bytes::from_static(b"hello"));
        let mut out = BytesMut::new();
        write_frame(&mut out, &f, &cipher());

        let mut src = out.freeze();
        let parsed = parse_frame(&mut src, &cipher()).unwrap();
        assert_eq!(parsed, f);
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn test_chain_roundtrip() {
        let frames = vec![
            Frame::control(42, OPT_SYNC_CONN_IDX),
            Frame::payload(1, 42, Bytes::from_static(b"first")),
            Frame::payload(2, 42, Bytes::from_static(b"second")),
        ];
        let mut body = marshal_chain(&frames, &cipher());
        let parsed = parse_chain(&mut body, &cipher()).unwrap();
        assert_eq!(parsed, frames);
    }

    #[test]
    fn test_terminator_stops_parse() {
        let mut body = marshal_chain(&[], &cipher());
        let f = parse_frame(&mut body, &cipher()).unwrap();
        assert!(f.is_terminator());
        assert!(f.data.is_empty());
    }

    #[test]
    fn test_unterminated_chain_rejected() {
        let mut out = BytesMut::new();
        write_frame(
            &mut out,
            &Frame::payload(1, 1, Bytes::from_static(b"x")),
            &cipher(),
        );
        let mut src = out.freeze();
        assert!(parse_chain(&mut src, &cipher()).is_none());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let f = Frame::payload(1, 1, Bytes::from_static(b"payload"));
        let mut out = BytesMut::new();
        write_frame(&mut out, &f, &cipher());
        let full = out.freeze();

        let mut truncated = full.slice(..full.len() - 3);
        assert!(parse_frame(&mut truncated, &cipher()).is_none());
    }

    #[test]
    fn test_corrupted_length_field_rejected() {
        let f = Frame::payload(1, 1, Bytes::from_static(b"payload"));
        let mut out = BytesMut::new();
        write_frame(&mut out, &f, &cipher());

        // Flip a bit inside the encrypted data_len field; CTR maps it to the
        // same bit of the plaintext, so the structural check must fire.
        let mut bytes = out.to_vec();
        bytes[4 + 14] ^= 0x01;
        let mut src = Bytes::from(bytes);
        assert!(parse_frame(&mut src, &cipher()).is_none());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let f = Frame::payload(1, 1, Bytes::from_static(b"secret"));
        let mut out = BytesMut::new();
        write_frame(&mut out, &f, &cipher());

        let mut src = out.freeze();
        assert!(parse_frame(&mut src, &FrameCipher::new("net2")).is_none());
    }

    #[test]
    fn test_control_frames_never_collide_with_sentinel() {
        for _ in 0..64 {
            assert_ne!(Frame::control(1, OPT_HELLO).idx, 0);
        }
    }

    #[test]
    fn test_empty_payload_frame() {
        // An empty flush is legal: the counter advances, no bytes delivered.
        let f = Frame::payload(3, 9, Bytes::new());
        let mut body = marshal_chain(std::slice::from_ref(&f), &cipher());
        let parsed = parse_chain(&mut body, &cipher()).unwrap();
        assert_eq!(parsed, vec![f]);
    }
}
