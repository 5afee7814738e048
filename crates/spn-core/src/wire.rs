//! Wire codecs for crane frames and terminal payloads.
//!
//! All formats are bit-exact between peers:
//!
//! ```text
//! crane frame:       varint(body_len) | varint(terminal_id) | body
//! terminal payload:  varint(op_id) | u8(msg_type) | body
//! OpStart body:      varint(name_len) | name | init
//! OpEnd body:        varint(error_code) | varint(msg_len) | msg
//! initial data:      varint(version) | varint(queue_size) | u8(flags)
//! ```
//!
//! Op id 0 is reserved: with `OpData` the body is `varint(credits)` (flow
//! control), with `OpEnd` the frame closes the whole terminal. Both are
//! consumed below the operation layer and never reach an operation table.
//!
//! Varints are unsigned LEB128. A crane frame with `body_len == 0` is
//! padding and is skipped by the receiver.

use crate::error::{Error, Result};

/// Protocol version carried in terminal initial data.
pub const WIRE_VERSION: u64 = 1;

/// Reserved op id used for flow control and terminal close.
pub const RESERVED_OP_ID: u32 = 0;

/// Upper bound accepted for advertised queue sizes.
pub const MAX_QUEUE_SIZE: u16 = 8192;

/// Message kinds inside a terminal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    /// Open a new operation; body carries the type name and init data.
    Start = 0,
    /// Payload for a running operation.
    Data = 1,
    /// Close an operation (or the terminal, on the reserved op id).
    End = 2,
}

impl MsgKind {
    /// Decode a message kind byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MsgKind::Start),
            1 => Ok(MsgKind::Data),
            2 => Ok(MsgKind::End),
            other => Err(Error::Malformed(format!("unknown msg type {other}"))),
        }
    }
}

fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(Error::Malformed(format!(
            "truncated payload: need {needed} bytes, have {}",
            data.len()
        )));
    }
    Ok(())
}

/// Append an unsigned LEB128 varint to `buf`.
///
/// # Example
///
/// ```
/// use spn_core::wire::put_varint;
///
/// let mut buf = Vec::new();
/// put_varint(&mut buf, 300);
/// assert_eq!(buf, vec![0xAC, 0x02]);
/// ```
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Read an unsigned LEB128 varint at `*offset`, advancing it.
///
/// # Example
///
/// ```
/// use spn_core::wire::read_varint;
///
/// let mut offset = 0;
/// let value = read_varint(&[0xAC, 0x02, 0xFF], &mut offset).unwrap();
/// assert_eq!(value, 300);
/// assert_eq!(offset, 2);
/// ```
pub fn read_varint(data: &[u8], offset: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        check_len(data, *offset + 1)?;
        let byte = data[*offset];
        *offset += 1;
        if shift == 63 && byte > 1 {
            return Err(Error::Malformed("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::Malformed("varint too long".into()));
        }
    }
}

fn read_varint_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let v = read_varint(data, offset)?;
    u32::try_from(v).map_err(|_| Error::Malformed("varint exceeds u32".into()))
}

/// Append one crane frame (`varint(len) | varint(terminal_id) | body`).
///
/// # Example
///
/// ```
/// use spn_core::wire::encode_crane_frame;
///
/// let mut buf = Vec::new();
/// encode_crane_frame(&mut buf, 7, b"hello");
/// assert_eq!(buf, vec![5, 7, b'h', b'e', b'l', b'l', b'o']);
/// ```
pub fn encode_crane_frame(buf: &mut Vec<u8>, terminal_id: u32, body: &[u8]) {
    put_varint(buf, body.len() as u64);
    put_varint(buf, u64::from(terminal_id));
    buf.extend_from_slice(body);
}

/// Parse one crane frame at `*offset`, advancing past it.
///
/// Returns the terminal id and the body slice; an empty body is a padding
/// frame the caller skips.
///
/// # Example
///
/// ```
/// use spn_core::wire::parse_crane_frame;
///
/// let blob = [5, 7, b'h', b'e', b'l', b'l', b'o'];
/// let mut offset = 0;
/// let (terminal_id, body) = parse_crane_frame(&blob, &mut offset).unwrap();
/// assert_eq!(terminal_id, 7);
/// assert_eq!(body, b"hello");
/// assert_eq!(offset, blob.len());
/// ```
pub fn parse_crane_frame<'a>(data: &'a [u8], offset: &mut usize) -> Result<(u32, &'a [u8])> {
    let body_len = read_varint(data, offset)? as usize;
    let terminal_id = read_varint_u32(data, offset)?;
    check_len(data, *offset + body_len)?;
    let body = &data[*offset..*offset + body_len];
    *offset += body_len;
    Ok((terminal_id, body))
}

/// A parsed terminal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalMsg {
    /// Operation the payload addresses (0 is reserved).
    pub op_id: u32,
    /// Message kind.
    pub kind: MsgKind,
    /// Kind-specific body.
    pub body: Vec<u8>,
}

impl TerminalMsg {
    /// Parse a full terminal payload.
    ///
    /// # Example
    ///
    /// ```
    /// use spn_core::wire::{MsgKind, TerminalMsg};
    ///
    /// let msg = TerminalMsg::parse(&[3, 1, b'p', b'i', b'n', b'g']).unwrap();
    /// assert_eq!(msg.op_id, 3);
    /// assert_eq!(msg.kind, MsgKind::Data);
    /// assert_eq!(msg.body, b"ping");
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let op_id = read_varint_u32(data, &mut offset)?;
        check_len(data, offset + 1)?;
        let kind = MsgKind::from_u8(data[offset])?;
        offset += 1;
        Ok(TerminalMsg {
            op_id,
            kind,
            body: data[offset..].to_vec(),
        })
    }

    /// Encode a terminal payload.
    ///
    /// # Example
    ///
    /// ```
    /// use spn_core::wire::{MsgKind, TerminalMsg};
    ///
    /// let payload = TerminalMsg::encode(3, MsgKind::Data, b"ping");
    /// assert_eq!(payload, vec![3, 1, b'p', b'i', b'n', b'g']);
    /// ```
    pub fn encode(op_id: u32, kind: MsgKind, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(body.len() + 6);
        put_varint(&mut buf, u64::from(op_id));
        buf.push(kind as u8);
        buf.extend_from_slice(body);
        buf
    }
}

/// Encode an OpStart payload carrying the registered type name and init data.
///
/// # Example
///
/// ```
/// use spn_core::wire::{encode_op_start, parse_op_start, TerminalMsg};
///
/// let payload = encode_op_start(3, "counter", &[1, 2]);
/// let msg = TerminalMsg::parse(&payload).unwrap();
/// let (name, init) = parse_op_start(&msg.body).unwrap();
/// assert_eq!(name, "counter");
/// assert_eq!(init, vec![1, 2]);
/// ```
pub fn encode_op_start(op_id: u32, name: &str, init: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(name.len() + init.len() + 2);
    put_varint(&mut body, name.len() as u64);
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(init);
    TerminalMsg::encode(op_id, MsgKind::Start, &body)
}

/// Parse an OpStart body into `(type name, init data)`.
pub fn parse_op_start(body: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut offset = 0;
    let name_len = read_varint(body, &mut offset)? as usize;
    check_len(body, offset + name_len)?;
    let name = std::str::from_utf8(&body[offset..offset + name_len])
        .map_err(|_| Error::Malformed("op type name is not utf-8".into()))?
        .to_string();
    offset += name_len;
    Ok((name, body[offset..].to_vec()))
}

/// Encode an OpData payload.
///
/// # Example
///
/// ```
/// use spn_core::wire::encode_op_data;
///
/// assert_eq!(encode_op_data(9, b"x"), vec![9, 1, b'x']);
/// ```
pub fn encode_op_data(op_id: u32, body: &[u8]) -> Vec<u8> {
    TerminalMsg::encode(op_id, MsgKind::Data, body)
}

/// Encode an error (or the clean code 0) as `varint(code) | varint(len) | msg`.
///
/// This body is shared by OpEnd payloads and crane close frames.
pub fn encode_error(err: Option<&Error>) -> Vec<u8> {
    let mut body = Vec::new();
    match err {
        None => {
            put_varint(&mut body, 0);
            put_varint(&mut body, 0);
        }
        Some(err) => {
            let msg = err.wire_message().as_bytes();
            put_varint(&mut body, u64::from(err.wire_code()));
            put_varint(&mut body, msg.len() as u64);
            body.extend_from_slice(msg);
        }
    }
    body
}

/// Encode an OpEnd payload. `None` encodes the clean end (code 0).
///
/// # Example
///
/// ```
/// use spn_core::error::Error;
/// use spn_core::wire::{encode_op_end, parse_op_end, TerminalMsg};
///
/// let payload = encode_op_end(5, Some(&Error::Timeout));
/// let msg = TerminalMsg::parse(&payload).unwrap();
/// assert_eq!(parse_op_end(&msg.body).unwrap(), Some(Error::Timeout));
/// ```
pub fn encode_op_end(op_id: u32, err: Option<&Error>) -> Vec<u8> {
    TerminalMsg::encode(op_id, MsgKind::End, &encode_error(err))
}

/// Parse an OpEnd body into the carried error, `None` for a clean end.
pub fn parse_op_end(body: &[u8]) -> Result<Option<Error>> {
    let mut offset = 0;
    let code = read_varint(body, &mut offset)?;
    let msg_len = read_varint(body, &mut offset)? as usize;
    check_len(body, offset + msg_len)?;
    let msg = String::from_utf8_lossy(&body[offset..offset + msg_len]).into_owned();
    Ok(Error::from_wire(code, msg))
}

/// Encode a flow-control credit frame on the reserved op id.
///
/// # Example
///
/// ```
/// use spn_core::wire::{encode_credits, peek_reserved, ReservedMsg};
///
/// let frame = encode_credits(17);
/// assert_eq!(peek_reserved(&frame).unwrap(), Some(ReservedMsg::Credits(17)));
/// ```
pub fn encode_credits(credits: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    put_varint(&mut body, u64::from(credits));
    TerminalMsg::encode(RESERVED_OP_ID, MsgKind::Data, &body)
}

/// Messages addressed to the reserved op id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservedMsg {
    /// The peer returns `n` send credits.
    Credits(u32),
    /// The peer closes the terminal, optionally with an error.
    Close(Option<Error>),
}

/// Peek whether a payload addresses the reserved op id.
///
/// Returns `Ok(None)` for regular operation traffic. Reserved frames are
/// validated here so that every decode path checks the reservation.
///
/// # Example
///
/// ```
/// use spn_core::wire::{encode_op_data, peek_reserved};
///
/// // regular operation traffic passes through untouched
/// let frame = encode_op_data(9, b"payload");
/// assert_eq!(peek_reserved(&frame).unwrap(), None);
/// ```
pub fn peek_reserved(data: &[u8]) -> Result<Option<ReservedMsg>> {
    let mut offset = 0;
    let op_id = read_varint_u32(data, &mut offset)?;
    if op_id != RESERVED_OP_ID {
        return Ok(None);
    }
    check_len(data, offset + 1)?;
    let kind = MsgKind::from_u8(data[offset])?;
    offset += 1;
    match kind {
        MsgKind::Data => {
            let credits = read_varint_u32(data, &mut offset)?;
            if credits == 0 {
                return Err(Error::Malformed("credit frame grants nothing".into()));
            }
            Ok(Some(ReservedMsg::Credits(credits)))
        }
        MsgKind::End => Ok(Some(ReservedMsg::Close(parse_op_end(&data[offset..])?))),
        MsgKind::Start => Err(Error::Malformed("op start on reserved op id".into())),
    }
}

/// The first frame sent on a new terminal id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialData {
    /// Protocol version, currently always [`WIRE_VERSION`].
    pub version: u64,
    /// Flow queue size both directions adopt.
    pub queue_size: u16,
    /// Whether this terminal was created by a relay while expanding.
    pub expanded: bool,
}

const INIT_FLAG_EXPANDED: u8 = 0b0000_0001;

impl InitialData {
    /// Encode the initial-data frame body.
    ///
    /// # Example
    ///
    /// ```
    /// use spn_core::wire::InitialData;
    ///
    /// let init = InitialData {
    ///     version: 1,
    ///     queue_size: 32,
    ///     expanded: false,
    /// };
    /// assert_eq!(init.encode(), vec![1, 32, 0]);
    /// assert_eq!(InitialData::parse(&init.encode()).unwrap(), init);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        put_varint(&mut buf, self.version);
        put_varint(&mut buf, u64::from(self.queue_size));
        buf.push(if self.expanded { INIT_FLAG_EXPANDED } else { 0 });
        buf
    }

    /// Parse and validate an initial-data frame body.
    ///
    /// Strict: unknown versions, zero or oversized queue sizes, unknown flag
    /// bits and trailing bytes are all rejected, so a stray data frame for a
    /// forgotten terminal id cannot masquerade as a new session.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let version = read_varint(data, &mut offset)?;
        if version != WIRE_VERSION {
            return Err(Error::Malformed(format!("unsupported version {version}")));
        }
        let queue_size = read_varint(data, &mut offset)?;
        if queue_size == 0 || queue_size > u64::from(MAX_QUEUE_SIZE) {
            return Err(Error::Malformed(format!("queue size {queue_size} out of range")));
        }
        check_len(data, offset + 1)?;
        let flags = data[offset];
        offset += 1;
        if flags & !INIT_FLAG_EXPANDED != 0 {
            return Err(Error::Malformed(format!("unknown init flags {flags:#04x}")));
        }
        if offset != data.len() {
            return Err(Error::Malformed("trailing bytes after initial data".into()));
        }
        Ok(InitialData {
            version,
            queue_size: queue_size as u16,
            expanded: flags & INIT_FLAG_EXPANDED != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_varint_vectors() {
        // (value, encoding)
        let vectors: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (300, &[0xAC, 0x02]),
            (u64::MAX, &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        ];
        for (value, encoding) in vectors {
            let mut buf = Vec::new();
            put_varint(&mut buf, *value);
            assert_eq!(&buf, encoding, "encoding of {value}");
            let mut offset = 0;
            assert_eq!(read_varint(&buf, &mut offset).unwrap(), *value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn test_varint_rejects_overflow() {
        // 11 continuation bytes cannot be a u64
        let data = [0xFF; 11];
        let mut offset = 0;
        assert!(read_varint(&data, &mut offset).is_err());
    }

    #[test]
    fn test_crane_frame_roundtrip_and_padding() {
        let mut buf = Vec::new();
        encode_crane_frame(&mut buf, 7, b"hello");
        encode_crane_frame(&mut buf, 0, b"");
        encode_crane_frame(&mut buf, 300, b"x");

        let mut offset = 0;
        let (tid, body) = parse_crane_frame(&buf, &mut offset).unwrap();
        assert_eq!((tid, body), (7, b"hello".as_slice()));
        let (tid, body) = parse_crane_frame(&buf, &mut offset).unwrap();
        assert_eq!((tid, body.len()), (0, 0));
        let (tid, body) = parse_crane_frame(&buf, &mut offset).unwrap();
        assert_eq!((tid, body), (300, b"x".as_slice()));
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn test_crane_frame_truncated_body() {
        let mut buf = Vec::new();
        encode_crane_frame(&mut buf, 1, b"abcdef");
        buf.truncate(buf.len() - 2);
        let mut offset = 0;
        assert!(parse_crane_frame(&buf, &mut offset).is_err());
    }

    #[test]
    fn test_op_start_roundtrip() {
        let payload = encode_op_start(3, "counter", &[1, 2, 3]);
        let msg = TerminalMsg::parse(&payload).unwrap();
        assert_eq!(msg.op_id, 3);
        assert_eq!(msg.kind, MsgKind::Start);
        let (name, init) = parse_op_start(&msg.body).unwrap();
        assert_eq!(name, "counter");
        assert_eq!(init, vec![1, 2, 3]);
    }

    #[test]
    fn test_op_end_carries_error() {
        let payload = encode_op_end(5, Some(&Error::HubUnreachable("hub-x".into())));
        let msg = TerminalMsg::parse(&payload).unwrap();
        assert_eq!(msg.kind, MsgKind::End);
        let err = parse_op_end(&msg.body).unwrap();
        assert_eq!(err, Some(Error::HubUnreachable("hub-x".into())));

        let clean = encode_op_end(5, None);
        let msg = TerminalMsg::parse(&clean).unwrap();
        assert_eq!(parse_op_end(&msg.body).unwrap(), None);
    }

    #[test]
    fn test_reserved_frames() {
        // credits
        let frame = encode_credits(17);
        assert_eq!(peek_reserved(&frame).unwrap(), Some(ReservedMsg::Credits(17)));

        // close
        let frame = encode_op_end(RESERVED_OP_ID, Some(&Error::CraneTorn));
        assert_eq!(
            peek_reserved(&frame).unwrap(),
            Some(ReservedMsg::Close(Some(Error::CraneTorn)))
        );

        // regular traffic passes through
        let frame = encode_op_data(9, b"payload");
        assert_eq!(peek_reserved(&frame).unwrap(), None);

        // op start on the reserved id is a protocol violation
        let frame = encode_op_start(RESERVED_OP_ID, "counter", &[]);
        assert!(peek_reserved(&frame).is_err());

        // zero-credit grants are rejected
        let mut body = Vec::new();
        put_varint(&mut body, 0);
        let frame = TerminalMsg::encode(RESERVED_OP_ID, MsgKind::Data, &body);
        assert!(peek_reserved(&frame).is_err());
    }

    #[test]
    fn test_initial_data_strictness() {
        let init = InitialData {
            version: WIRE_VERSION,
            queue_size: 32,
            expanded: true,
        };
        let buf = init.encode();
        assert_eq!(InitialData::parse(&buf).unwrap(), init);

        // wrong version
        let mut bad = Vec::new();
        put_varint(&mut bad, 9);
        put_varint(&mut bad, 32);
        bad.push(0);
        assert!(InitialData::parse(&bad).is_err());

        // zero queue size
        let mut bad = Vec::new();
        put_varint(&mut bad, WIRE_VERSION);
        put_varint(&mut bad, 0);
        bad.push(0);
        assert!(InitialData::parse(&bad).is_err());

        // trailing bytes
        let mut bad = init.encode();
        bad.push(0xAA);
        assert!(InitialData::parse(&bad).is_err());

        // unknown flags
        let mut bad = init.encode();
        let last = bad.len() - 1;
        bad[last] = 0x80;
        assert!(InitialData::parse(&bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(value in any::<u64>()) {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let mut offset = 0;
            prop_assert_eq!(read_varint(&buf, &mut offset).unwrap(), value);
            prop_assert_eq!(offset, buf.len());
        }

        #[test]
        fn prop_terminal_msg_roundtrip(op_id in 0u32..=u32::MAX, body in proptest::collection::vec(any::<u8>(), 0..64)) {
            let payload = TerminalMsg::encode(op_id, MsgKind::Data, &body);
            let msg = TerminalMsg::parse(&payload).unwrap();
            prop_assert_eq!(msg.op_id, op_id);
            prop_assert_eq!(msg.body, body);
        }
    }
}
