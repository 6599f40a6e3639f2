//! Binary codec for coherence messages.
//!
//! Every message starts with the common header:
//!
//! ```text
//! [tag:1][message_id:8][flags:1]
//! ```
//!
//! followed by the variant body. All multibyte integers are big-endian;
//! booleans are one byte. There is no outer length prefix; framing belongs
//! to the transport.
//!
//! There are two wire forms:
//!
//! 1. **Flat stream** ([`encode_flat`] / [`decode_flat`], plus the
//!    [`write_flat`] / [`read_flat`] stream forms): after the variant body,
//!    each payload buffer is written as `[len:2][bytes]`.
//!
//! 2. **Scatter-gather vector** ([`encode_buffers`] / [`decode_buffers`]):
//!    buffer 0 holds the common header, the variant body, and **all** payload
//!    length prefixes batched together; the payload buffers follow by
//!    reference, uncopied, as buffers 1..N.
//!
//! The two forms are not interchangeable: lengths sit next to their payloads
//! in the flat form but are batched in the header in the vector form, so a
//! multi-buffer message encoded one way will not parse the other way. (For
//! messages with at most one payload buffer the byte sequences happen to
//! coincide; do not rely on it.)

use std::io::{Read, Write};

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::messages::{
    DataBuf, Flags, Message, MessageType, Payload, MAX_DATA_LEN, MAX_SHARERS, UNASSIGNED_ID,
};

/// Errors surfaced by the encoder and decoder.
///
/// A decode error means the frame is unusable and the transport should reset
/// the connection; nothing here is retriable at this layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The leading tag byte is not a known message type.
    #[error("unknown message tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// The input ended before the declared structure was complete.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A payload buffer, sharer list, or inline data block is too long for
    /// its 16-bit length prefix.
    #[error("data of {len} bytes exceeds maximum of {max}")]
    DataTooLarge { len: usize, max: usize },

    /// Underlying stream failure on the `io::Read`/`io::Write` paths.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes `msg` into its flat-stream form.
///
/// # Errors
///
/// Returns [`ProtocolError::DataTooLarge`] if a payload buffer, the sharer
/// list, or inline MSG data exceeds the 16-bit length limit.
pub fn encode_flat(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    encode_header(msg, &mut buf)?;
    for i in 0..msg.num_data_buffers() {
        let data = msg.data_buffer(i);
        write_len_prefix(&mut buf, data.len())?;
        buf.extend_from_slice(data.as_slice());
    }
    Ok(buf)
}

/// Writes the flat-stream form of `msg` to `out` and returns the number of
/// bytes written.
///
/// # Errors
///
/// Returns [`ProtocolError::DataTooLarge`] for oversize data or
/// [`ProtocolError::Io`] if the write fails.
pub fn write_flat<W: Write>(msg: &Message, out: &mut W) -> Result<usize, ProtocolError> {
    let bytes = encode_flat(msg)?;
    out.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Encodes `msg` into its scatter-gather form: a freshly-allocated header
/// buffer followed by the payload buffers by reference.
///
/// The first buffer is new and the transport may consume it freely. The
/// remaining buffers alias the message's payload storage; a transport that
/// queues the message instead of sending it inline must call
/// [`Message::clone_data_buffers`] first.
///
/// # Errors
///
/// Returns [`ProtocolError::DataTooLarge`] for oversize data.
pub fn encode_buffers(msg: &Message) -> Result<Vec<Bytes>, ProtocolError> {
    let n = msg.num_data_buffers();
    let mut head = Vec::with_capacity(msg.header_len());
    encode_header(msg, &mut head)?;
    for i in 0..n {
        write_len_prefix(&mut head, msg.data_buffer(i).len())?;
    }

    let mut buffers = Vec::with_capacity(1 + n);
    buffers.push(Bytes::from(head));
    for i in 0..n {
        buffers.push(msg.data_buffer(i).share());
    }
    Ok(buffers)
}

/// Common header plus variant body: everything except payload buffers and
/// their length prefixes. Shared by both wire forms.
fn encode_header(msg: &Message, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    buf.push(msg.message_type().as_u8());
    buf.extend_from_slice(&msg.message_id().to_be_bytes());
    buf.push(msg.flags().bits());
    encode_body(msg.payload(), buf)
}

fn encode_body(payload: &Payload, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match payload {
        Payload::Get { line }
        | Payload::GetX { line }
        | Payload::InvAck { line }
        | Payload::Del { line }
        | Payload::NotFound { line }
        | Payload::Timeout { line }
        | Payload::MsgAck { line } => buf.extend_from_slice(&line.to_be_bytes()),
        Payload::Inv { line, previous_owner } => {
            buf.extend_from_slice(&line.to_be_bytes());
            buf.extend_from_slice(&previous_owner.to_be_bytes());
        }
        Payload::Put { line, version, .. } | Payload::Backup { line, version, .. } => {
            buf.extend_from_slice(&line.to_be_bytes());
            buf.extend_from_slice(&version.to_be_bytes());
        }
        Payload::PutX { line, version, sharers, .. } => {
            if sharers.len() > MAX_SHARERS {
                return Err(ProtocolError::DataTooLarge { len: sharers.len(), max: MAX_SHARERS });
            }
            buf.extend_from_slice(&line.to_be_bytes());
            buf.extend_from_slice(&version.to_be_bytes());
            buf.extend_from_slice(&(sharers.len() as u16).to_be_bytes());
            for sharer in sharers {
                buf.extend_from_slice(&sharer.to_be_bytes());
            }
        }
        Payload::ChangedOwner { line, certain, new_owner } => {
            buf.extend_from_slice(&line.to_be_bytes());
            buf.push(u8::from(*certain));
            buf.extend_from_slice(&new_owner.to_be_bytes());
        }
        Payload::BackupAck { line, version } => {
            buf.extend_from_slice(&line.to_be_bytes());
            buf.extend_from_slice(&version.to_be_bytes());
        }
        Payload::BackupPacket { id, backups } => {
            buf.extend_from_slice(&id.to_be_bytes());
            buf.extend_from_slice(&(backups.len() as u32).to_be_bytes());
            for backup in backups {
                match backup.payload() {
                    Payload::Backup { line, version, .. } => {
                        buf.extend_from_slice(&line.to_be_bytes());
                        buf.extend_from_slice(&version.to_be_bytes());
                    }
                    _ => unreachable!("backup packet contains only BACKUP messages"),
                }
            }
        }
        Payload::BackupPacketAck { id } => buf.extend_from_slice(&id.to_be_bytes()),
        Payload::Msg { line, data } => {
            buf.extend_from_slice(&line.to_be_bytes());
            write_len_prefix(buf, data.len())?;
            buf.extend_from_slice(data);
        }
        Payload::Ack => {}
    }
    Ok(())
}

fn write_len_prefix(buf: &mut Vec<u8>, len: usize) -> Result<(), ProtocolError> {
    if len > MAX_DATA_LEN {
        return Err(ProtocolError::DataTooLarge { len, max: MAX_DATA_LEN });
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

// ── Wire input sources ────────────────────────────────────────────────────────

/// Input abstraction shared by the slice, zero-copy buffer, and stream
/// decoders, so the variant-body reader exists once.
trait WireInput {
    /// Fills `buf` completely or fails.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError>;

    /// Consumes `len` bytes of bulk data. Zero-copy where the source allows.
    fn take_data(&mut self, len: usize) -> Result<Bytes, ProtocolError>;

    /// Verifies that `len` more bytes exist before a count-driven
    /// allocation. Sources that cannot know (streams) report success and let
    /// the subsequent reads fail instead.
    fn ensure_available(&mut self, len: usize) -> Result<(), ProtocolError>;
}

struct SliceInput<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> SliceInput<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn check(&self, len: usize) -> Result<(), ProtocolError> {
        if self.bytes.len() < self.off + len {
            return Err(ProtocolError::InsufficientData {
                needed: self.off + len,
                available: self.bytes.len(),
            });
        }
        Ok(())
    }
}

impl WireInput for SliceInput<'_> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.check(buf.len())?;
        buf.copy_from_slice(&self.bytes[self.off..self.off + buf.len()]);
        self.off += buf.len();
        Ok(())
    }

    fn take_data(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.check(len)?;
        let data = Bytes::copy_from_slice(&self.bytes[self.off..self.off + len]);
        self.off += len;
        Ok(data)
    }

    fn ensure_available(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.check(len)
    }
}

/// Like [`SliceInput`], but bulk data is sliced out of the backing `Bytes`
/// without copying. Slices share storage with the source yet carry their own
/// position, so the caller can consume them independently.
struct BufferInput<'a> {
    source: &'a Bytes,
    off: usize,
}

impl<'a> BufferInput<'a> {
    fn new(source: &'a Bytes) -> Self {
        Self { source, off: 0 }
    }

    fn check(&self, len: usize) -> Result<(), ProtocolError> {
        if self.source.len() < self.off + len {
            return Err(ProtocolError::InsufficientData {
                needed: self.off + len,
                available: self.source.len(),
            });
        }
        Ok(())
    }
}

impl WireInput for BufferInput<'_> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.check(buf.len())?;
        buf.copy_from_slice(&self.source[self.off..self.off + buf.len()]);
        self.off += buf.len();
        Ok(())
    }

    fn take_data(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.check(len)?;
        let data = self.source.slice(self.off..self.off + len);
        self.off += len;
        Ok(data)
    }

    fn ensure_available(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.check(len)
    }
}

struct StreamInput<R> {
    reader: R,
}

impl<R: Read> WireInput for StreamInput<R> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.reader.read_exact(buf)?;
        Ok(())
    }

    fn take_data(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data)?;
        Ok(Bytes::from(data))
    }

    fn ensure_available(&mut self, _len: usize) -> Result<(), ProtocolError> {
        Ok(())
    }
}

fn read_u8(input: &mut impl WireInput) -> Result<u8, ProtocolError> {
    let mut buf = [0u8; 1];
    input.fill(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(input: &mut impl WireInput) -> Result<u16, ProtocolError> {
    let mut buf = [0u8; 2];
    input.fill(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_i16(input: &mut impl WireInput) -> Result<i16, ProtocolError> {
    let mut buf = [0u8; 2];
    input.fill(&mut buf)?;
    Ok(i16::from_be_bytes(buf))
}

fn read_u32(input: &mut impl WireInput) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; 4];
    input.fill(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(input: &mut impl WireInput) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    input.fill(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_i64(input: &mut impl WireInput) -> Result<i64, ProtocolError> {
    let mut buf = [0u8; 8];
    input.fill(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes one flat-form message from the beginning of `bytes`.
///
/// Returns the message and the number of bytes consumed so the caller can
/// advance its read cursor. The message arrives with direction incoming and
/// an unset peer; the transport fills both in.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownTag`] or
/// [`ProtocolError::InsufficientData`] for malformed input.
pub fn decode_flat(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let mut input = SliceInput::new(bytes);
    let mut msg = decode_message(&mut input)?;
    fill_flat_buffers(&mut msg, &mut input)?;
    Ok((msg, input.off))
}

/// Reads one flat-form message from a stream.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownTag`] for an unknown tag or
/// [`ProtocolError::Io`] (unexpected EOF included) for a truncated or failed
/// read.
pub fn read_flat<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut input = StreamInput { reader };
    let mut msg = decode_message(&mut input)?;
    fill_flat_buffers(&mut msg, &mut input)?;
    Ok(msg)
}

/// Decodes one vector-form message from `source`.
///
/// Payload buffers are sliced out of `source` without copying: they share
/// its storage but carry independent positions. Returns the message and the
/// number of bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError::UnknownTag`] or
/// [`ProtocolError::InsufficientData`] for malformed input.
pub fn decode_buffers(source: &Bytes) -> Result<(Message, usize), ProtocolError> {
    let mut input = BufferInput::new(source);
    let mut msg = decode_message(&mut input)?;

    let n = msg.num_data_buffers();
    let mut lens = Vec::with_capacity(n);
    for _ in 0..n {
        lens.push(read_u16(&mut input)? as usize);
    }
    for (i, len) in lens.into_iter().enumerate() {
        let data = input.take_data(len)?;
        msg.set_data_buffer(i, DataBuf::Owned(data));
    }
    Ok((msg, input.off))
}

/// Flat-form trailer: `[len:2][bytes]` per payload buffer.
fn fill_flat_buffers(msg: &mut Message, input: &mut impl WireInput) -> Result<(), ProtocolError> {
    for i in 0..msg.num_data_buffers() {
        let len = read_u16(input)? as usize;
        let data = input.take_data(len)?;
        msg.set_data_buffer(i, DataBuf::Owned(data));
    }
    Ok(())
}

/// Common header plus variant body, shared by all decode paths.
fn decode_message(input: &mut impl WireInput) -> Result<Message, ProtocolError> {
    let tag = read_u8(input)?;
    let ty = MessageType::try_from(tag).map_err(|()| ProtocolError::UnknownTag(tag))?;
    let message_id = read_i64(input)?;
    let flags = Flags::from_bits(read_u8(input)?);
    let payload = decode_body(ty, input)?;
    Ok(Message::from_wire(message_id, flags, payload))
}

fn decode_body(ty: MessageType, input: &mut impl WireInput) -> Result<Payload, ProtocolError> {
    let payload = match ty {
        MessageType::Get => Payload::Get { line: read_u64(input)? },
        MessageType::GetX => Payload::GetX { line: read_u64(input)? },
        MessageType::Inv => Payload::Inv {
            line: read_u64(input)?,
            previous_owner: read_i16(input)?,
        },
        MessageType::InvAck => Payload::InvAck { line: read_u64(input)? },
        MessageType::Put => Payload::Put {
            line: read_u64(input)?,
            version: read_u64(input)?,
            data: DataBuf::Owned(Bytes::new()),
        },
        MessageType::PutX => {
            let line = read_u64(input)?;
            let version = read_u64(input)?;
            let count = read_u16(input)? as usize;
            input.ensure_available(2 * count)?;
            let mut sharers = Vec::with_capacity(count);
            for _ in 0..count {
                sharers.push(read_i16(input)?);
            }
            Payload::PutX { line, version, sharers, data: DataBuf::Owned(Bytes::new()) }
        }
        MessageType::Del => Payload::Del { line: read_u64(input)? },
        MessageType::ChangedOwner => Payload::ChangedOwner {
            line: read_u64(input)?,
            certain: read_u8(input)? != 0,
            new_owner: read_i16(input)?,
        },
        MessageType::NotFound => Payload::NotFound { line: read_u64(input)? },
        MessageType::Timeout => Payload::Timeout { line: read_u64(input)? },
        MessageType::Backup => Payload::Backup {
            line: read_u64(input)?,
            version: read_u64(input)?,
            data: DataBuf::Owned(Bytes::new()),
        },
        MessageType::BackupAck => Payload::BackupAck {
            line: read_u64(input)?,
            version: read_u64(input)?,
        },
        MessageType::BackupPacket => {
            let id = read_u64(input)?;
            let count = read_u32(input)? as usize;
            input.ensure_available(count.saturating_mul(16))?;
            let mut backups = Vec::with_capacity(count);
            for _ in 0..count {
                let line = read_u64(input)?;
                let version = read_u64(input)?;
                backups.push(Message::from_wire(
                    UNASSIGNED_ID,
                    Flags::default(),
                    Payload::Backup { line, version, data: DataBuf::Owned(Bytes::new()) },
                ));
            }
            Payload::BackupPacket { id, backups }
        }
        MessageType::BackupPacketAck => Payload::BackupPacketAck { id: read_u64(input)? },
        MessageType::Msg => {
            let line = read_u64(input)?;
            let len = read_u16(input)? as usize;
            let data = input.take_data(len)?;
            Payload::Msg { line, data }
        }
        MessageType::MsgAck => Payload::MsgAck { line: read_u64(input)? },
        MessageType::Ack => Payload::Ack,
    };
    Ok(payload)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
