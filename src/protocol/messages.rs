//! Coherence protocol message types.
//!
//! Every message is built through a smart constructor that fixes its flag
//! shape: unicast requests, multicast requests (peer list carried by the
//! transport), and responses (which copy the request's message id and peer).
//! The serialized state of a message is its tag, message id, flag byte, and
//! variant body; direction, peer, and timestamp are transient routing
//! metadata owned by whichever side of the transport touched the message
//! last.

use std::fmt;

use bytes::Bytes;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the common wire header: `[tag:1][message_id:8][flags:1]`.
pub const MESSAGE_HEADER_LEN: usize = 10;

/// Maximum length of a payload buffer or inline data block, in bytes.
///
/// Lengths travel as unsigned 16-bit prefixes, so anything longer cannot be
/// framed.
pub const MAX_DATA_LEN: usize = u16::MAX as usize;

/// Maximum number of entries in a `PUTX` sharer list.
pub const MAX_SHARERS: usize = u16::MAX as usize;

/// Message id value meaning "not yet assigned by the transport".
pub const UNASSIGNED_ID: i64 = -1;

/// Peer value addressing every reachable node.
pub const BROADCAST_PEER: i16 = -1;

// ── Message type tags ─────────────────────────────────────────────────────────

/// All coherence message tags.
///
/// The ordinal **is** the wire tag byte and is part of the interoperability
/// contract: the order below must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Get = 0,
    GetX = 1,
    Inv = 2,
    InvAck = 3,
    Put = 4,
    PutX = 5,
    Del = 6,
    ChangedOwner = 7,
    NotFound = 8,
    Timeout = 9,
    Backup = 10,
    BackupAck = 11,
    BackupPacket = 12,
    BackupPacketAck = 13,
    Msg = 14,
    MsgAck = 15,
    Ack = 16,
}

impl MessageType {
    /// Returns the wire tag byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the transport must retry a request of this type until a
    /// pairing response arrives or its timeout fires.
    ///
    /// Other request types may still ask for a reply, but the transport is
    /// free to treat them as fire-and-forget when the producer clears
    /// `REPLY_REQUIRED`.
    #[must_use]
    pub const fn requires_response(self) -> bool {
        matches!(
            self,
            MessageType::Get | MessageType::GetX | MessageType::Inv | MessageType::BackupPacket
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(MessageType::Get),
            1 => Ok(MessageType::GetX),
            2 => Ok(MessageType::Inv),
            3 => Ok(MessageType::InvAck),
            4 => Ok(MessageType::Put),
            5 => Ok(MessageType::PutX),
            6 => Ok(MessageType::Del),
            7 => Ok(MessageType::ChangedOwner),
            8 => Ok(MessageType::NotFound),
            9 => Ok(MessageType::Timeout),
            10 => Ok(MessageType::Backup),
            11 => Ok(MessageType::BackupAck),
            12 => Ok(MessageType::BackupPacket),
            13 => Ok(MessageType::BackupPacketAck),
            14 => Ok(MessageType::Msg),
            15 => Ok(MessageType::MsgAck),
            16 => Ok(MessageType::Ack),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Get => "GET",
            MessageType::GetX => "GETX",
            MessageType::Inv => "INV",
            MessageType::InvAck => "INVACK",
            MessageType::Put => "PUT",
            MessageType::PutX => "PUTX",
            MessageType::Del => "DEL",
            MessageType::ChangedOwner => "CHNGD_OWNR",
            MessageType::NotFound => "NOT_FOUND",
            MessageType::Timeout => "TIMEOUT",
            MessageType::Backup => "BACKUP",
            MessageType::BackupAck => "BACKUPACK",
            MessageType::BackupPacket => "BACKUP_PACKET",
            MessageType::BackupPacketAck => "BACKUP_PACKETACK",
            MessageType::Msg => "MSG",
            MessageType::MsgAck => "MSGACK",
            MessageType::Ack => "ACK",
        };
        f.write_str(name)
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Message flag byte.
///
/// Bit layout:
/// - Bit 0: RESPONSE – this message replies to a prior request.
/// - Bit 1: BROADCAST – addressed to every node (peer is −1).
/// - Bit 2: REPLY_REQUIRED – the sender expects a pairing response.
///
/// Unknown bits are carried verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const RESPONSE: u8 = 1;
    pub const BROADCAST: u8 = 1 << 1;
    pub const REPLY_REQUIRED: u8 = 1 << 2;

    /// Wraps a raw flag byte as read off the wire.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw flag byte as written on the wire.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if the RESPONSE bit is set.
    #[must_use]
    pub const fn response(self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    /// Returns `true` if the BROADCAST bit is set.
    #[must_use]
    pub const fn broadcast(self) -> bool {
        self.0 & Self::BROADCAST != 0
    }

    /// Returns `true` if the REPLY_REQUIRED bit is set.
    #[must_use]
    pub const fn reply_required(self) -> bool {
        self.0 & Self::REPLY_REQUIRED != 0
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

// ── Transient routing metadata ────────────────────────────────────────────────

/// Whether a message was received from the wire or produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Transport-side addressing state. Never serialized.
#[derive(Debug, Clone)]
struct Routing {
    direction: Direction,
    /// Destination for outgoing, source for incoming. −1 means broadcast on
    /// outgoing messages and "not yet set by the transport" on incoming ones.
    peer: i16,
    timestamp_us: u64,
}

// ── Payload buffers ───────────────────────────────────────────────────────────

/// An ownership-tagged payload buffer.
///
/// `Owned` data is safe for the transport to hold past the synchronous send
/// call. `Borrowed` data aliases producer-managed storage whose stability is
/// only promised for the duration of the send; a transport that queues the
/// message must deep-copy it first ([`Message::clone_data_buffers`]).
///
/// Equality compares contents only; the tag is transport bookkeeping, not
/// wire state.
#[derive(Debug, Clone)]
pub enum DataBuf {
    Owned(Bytes),
    Borrowed(Bytes),
}

impl DataBuf {
    /// The buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            DataBuf::Owned(b) | DataBuf::Borrowed(b) => b,
        }
    }

    /// A by-reference handle to the contents (no copy).
    #[must_use]
    pub fn share(&self) -> Bytes {
        match self {
            DataBuf::Owned(b) | DataBuf::Borrowed(b) => b.clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Returns `true` if the buffer aliases producer-managed storage.
    #[must_use]
    pub const fn is_borrowed(&self) -> bool {
        matches!(self, DataBuf::Borrowed(_))
    }

    /// Deep copy into independently-owned storage.
    #[must_use]
    pub fn to_owned_buf(&self) -> DataBuf {
        DataBuf::Owned(Bytes::copy_from_slice(self.as_slice()))
    }
}

impl PartialEq for DataBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for DataBuf {}

// ── Variant bodies ────────────────────────────────────────────────────────────

/// Variant-specific message body.
///
/// `Get` and `GetX` share a shape but stay distinct variants, so the tag can
/// never disagree with the body. `Backup` reuses `Put`'s body layout on the
/// wire. A `BackupPacket` holds full `Backup` messages so that rewriting the
/// packet's peer can reach each contained backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Get { line: u64 },
    GetX { line: u64 },
    Inv { line: u64, previous_owner: i16 },
    InvAck { line: u64 },
    Put { line: u64, version: u64, data: DataBuf },
    PutX { line: u64, version: u64, sharers: Vec<i16>, data: DataBuf },
    Del { line: u64 },
    ChangedOwner { line: u64, certain: bool, new_owner: i16 },
    NotFound { line: u64 },
    Timeout { line: u64 },
    Backup { line: u64, version: u64, data: DataBuf },
    BackupAck { line: u64, version: u64 },
    BackupPacket { id: u64, backups: Vec<Message> },
    BackupPacketAck { id: u64 },
    Msg { line: u64, data: Bytes },
    MsgAck { line: u64 },
    Ack,
}

impl Payload {
    /// The wire tag for this body.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Get { .. } => MessageType::Get,
            Payload::GetX { .. } => MessageType::GetX,
            Payload::Inv { .. } => MessageType::Inv,
            Payload::InvAck { .. } => MessageType::InvAck,
            Payload::Put { .. } => MessageType::Put,
            Payload::PutX { .. } => MessageType::PutX,
            Payload::Del { .. } => MessageType::Del,
            Payload::ChangedOwner { .. } => MessageType::ChangedOwner,
            Payload::NotFound { .. } => MessageType::NotFound,
            Payload::Timeout { .. } => MessageType::Timeout,
            Payload::Backup { .. } => MessageType::Backup,
            Payload::BackupAck { .. } => MessageType::BackupAck,
            Payload::BackupPacket { .. } => MessageType::BackupPacket,
            Payload::BackupPacketAck { .. } => MessageType::BackupPacketAck,
            Payload::Msg { .. } => MessageType::Msg,
            Payload::MsgAck { .. } => MessageType::MsgAck,
            Payload::Ack => MessageType::Ack,
        }
    }

    /// Flat-form body length in bytes, excluding payload length prefixes.
    pub(crate) fn body_len(&self) -> usize {
        match self {
            Payload::Get { .. }
            | Payload::GetX { .. }
            | Payload::InvAck { .. }
            | Payload::Del { .. }
            | Payload::NotFound { .. }
            | Payload::Timeout { .. }
            | Payload::MsgAck { .. }
            | Payload::BackupPacketAck { .. } => 8,
            Payload::Inv { .. } => 8 + 2,
            Payload::Put { .. } | Payload::Backup { .. } | Payload::BackupAck { .. } => 8 + 8,
            Payload::PutX { sharers, .. } => 8 + 8 + 2 + 2 * sharers.len(),
            Payload::ChangedOwner { .. } => 8 + 1 + 2,
            Payload::BackupPacket { backups, .. } => 8 + 4 + 16 * backups.len(),
            Payload::Msg { data, .. } => 8 + 2 + data.len(),
            Payload::Ack => 0,
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

/// A coherence protocol message: serialized header (message id + flags),
/// variant body, and transient routing metadata.
///
/// Messages are built through the type-specific constructors below, which
/// enforce the request/response/broadcast flag shapes. `PartialEq` compares
/// the serialized fields only (transient routing is ignored); correlating a
/// response with its request is a different relation; see
/// [`Message::pairs_with`].
#[derive(Debug, Clone)]
pub struct Message {
    message_id: i64,
    flags: Flags,
    routing: Routing,
    payload: Payload,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.message_id == other.message_id
            && self.flags == other.flags
            && self.payload == other.payload
    }
}

impl Eq for Message {}

// ── Base construction patterns ────────────────────────────────────────────────

impl Message {
    /// Outgoing unicast request. Broadcast iff `peer` is −1.
    fn request(peer: i16, payload: Payload) -> Message {
        let mut flags = Flags::default();
        flags.set(Flags::REPLY_REQUIRED, true);
        flags.set(Flags::BROADCAST, peer == BROADCAST_PEER);
        Message {
            message_id: UNASSIGNED_ID,
            flags,
            routing: Routing {
                direction: Direction::Outgoing,
                peer,
                timestamp_us: 0,
            },
            payload,
        }
    }

    /// Outgoing multicast request. The peer list is sorted in place and then
    /// carried to the transport by the caller; the message itself is
    /// addressed to −1 with BROADCAST clear.
    fn multicast(peers: &mut [i16], payload: Payload) -> Message {
        peers.sort_unstable();
        let mut flags = Flags::default();
        flags.set(Flags::REPLY_REQUIRED, true);
        Message {
            message_id: UNASSIGNED_ID,
            flags,
            routing: Routing {
                direction: Direction::Outgoing,
                peer: BROADCAST_PEER,
                timestamp_us: 0,
            },
            payload,
        }
    }

    /// Outgoing response: copies the request's message id and peer, sets
    /// RESPONSE, clears BROADCAST and REPLY_REQUIRED.
    ///
    /// # Panics
    ///
    /// Panics if the request's message id is unassigned: a response must
    /// echo a real id or it can never pair.
    fn response(to: &Message, payload: Payload) -> Message {
        assert!(
            to.message_id >= 0,
            "cannot respond to a request with an unassigned message id"
        );
        let mut flags = Flags::default();
        flags.set(Flags::RESPONSE, true);
        Message {
            message_id: to.message_id,
            flags,
            routing: Routing {
                direction: Direction::Outgoing,
                peer: to.routing.peer,
                timestamp_us: 0,
            },
            payload,
        }
    }

    /// Fresh message as materialized by the decoder.
    pub(crate) fn from_wire(message_id: i64, flags: Flags, payload: Payload) -> Message {
        Message {
            message_id,
            flags,
            routing: Routing {
                direction: Direction::Incoming,
                peer: -1,
                timestamp_us: 0,
            },
            payload,
        }
    }

    fn request_line(to: &Message) -> u64 {
        match to.line() {
            Some(line) => line,
            None => panic!("request {to} does not carry a line"),
        }
    }
}

// ── Smart constructors ────────────────────────────────────────────────────────

impl Message {
    /// Request a read copy of `line` from `peer`.
    #[must_use]
    pub fn get(peer: i16, line: u64) -> Message {
        Message::request(peer, Payload::Get { line })
    }

    /// Request exclusive ownership of `line` from `peer`.
    #[must_use]
    pub fn getx(peer: i16, line: u64) -> Message {
        Message::request(peer, Payload::GetX { line })
    }

    /// Ask `peer` to drop its copy of `line`. `previous_owner` names the node
    /// that held ownership when this invalidation was issued, so the
    /// recipient can forward it if ownership moved in flight.
    #[must_use]
    pub fn inv(peer: i16, line: u64, previous_owner: i16) -> Message {
        Message::request(peer, Payload::Inv { line, previous_owner })
    }

    /// Invalidation sent as a response (e.g. answering a GETX).
    ///
    /// # Panics
    ///
    /// Panics if `line` differs from the request's line.
    #[must_use]
    pub fn inv_response(to: &Message, line: u64, previous_owner: i16) -> Message {
        assert_eq!(Some(line), to.line(), "response line must match the request line");
        Message::response(to, Payload::Inv { line, previous_owner })
    }

    /// Acknowledge an invalidation of `line`. Also sent unsolicited on
    /// eviction, hence the unicast form.
    #[must_use]
    pub fn invack(peer: i16, line: u64) -> Message {
        Message::request(peer, Payload::InvAck { line })
    }

    /// Acknowledge the given INV.
    #[must_use]
    pub fn invack_response(to: &Message) -> Message {
        let line = Message::request_line(to);
        Message::response(to, Payload::InvAck { line })
    }

    /// Tell `peer` that `line` was deleted.
    #[must_use]
    pub fn del(peer: i16, line: u64) -> Message {
        Message::request(peer, Payload::Del { line })
    }

    /// Push a read copy of `line` at `version` to `peer`.
    #[must_use]
    pub fn put(peer: i16, line: u64, version: u64, data: DataBuf) -> Message {
        Message::request(peer, Payload::Put { line, version, data })
    }

    /// Answer a GET with the line contents.
    ///
    /// # Panics
    ///
    /// Panics if `line` differs from the request's line.
    #[must_use]
    pub fn put_response(to: &Message, line: u64, version: u64, data: DataBuf) -> Message {
        assert_eq!(Some(line), to.line(), "response line must match the request line");
        Message::response(to, Payload::Put { line, version, data })
    }

    /// Push a read copy of `line` to several peers at once. Sorts `peers` in
    /// place; the caller hands the sorted list to the transport.
    #[must_use]
    pub fn put_multicast(peers: &mut [i16], line: u64, version: u64, data: DataBuf) -> Message {
        Message::multicast(peers, Payload::Put { line, version, data })
    }

    /// Transfer exclusive ownership of `line` to `peer`, naming the current
    /// sharers the new owner must invalidate.
    ///
    /// # Panics
    ///
    /// Panics if `sharers` has more than [`MAX_SHARERS`] entries.
    #[must_use]
    pub fn putx(peer: i16, line: u64, version: u64, sharers: Vec<i16>, data: DataBuf) -> Message {
        assert!(
            sharers.len() <= MAX_SHARERS,
            "sharer list of {} entries exceeds maximum of {}",
            sharers.len(),
            MAX_SHARERS
        );
        Message::request(peer, Payload::PutX { line, version, sharers, data })
    }

    /// Answer a GETX with ownership of the line.
    ///
    /// # Panics
    ///
    /// Panics if `line` differs from the request's line or `sharers` exceeds
    /// [`MAX_SHARERS`].
    #[must_use]
    pub fn putx_response(
        to: &Message,
        line: u64,
        version: u64,
        sharers: Vec<i16>,
        data: DataBuf,
    ) -> Message {
        assert_eq!(Some(line), to.line(), "response line must match the request line");
        assert!(
            sharers.len() <= MAX_SHARERS,
            "sharer list of {} entries exceeds maximum of {}",
            sharers.len(),
            MAX_SHARERS
        );
        Message::response(to, Payload::PutX { line, version, sharers, data })
    }

    /// Report that ownership of `line` moved to `new_owner`. `certain` marks
    /// an authoritative update from the new owner itself rather than a
    /// forwarded hint.
    #[must_use]
    pub fn changed_owner(peer: i16, line: u64, new_owner: i16, certain: bool) -> Message {
        Message::request(peer, Payload::ChangedOwner { line, certain, new_owner })
    }

    /// Ownership-change notice sent as a response.
    ///
    /// # Panics
    ///
    /// Panics if `line` differs from the request's line.
    #[must_use]
    pub fn changed_owner_response(
        to: &Message,
        line: u64,
        new_owner: i16,
        certain: bool,
    ) -> Message {
        assert_eq!(Some(line), to.line(), "response line must match the request line");
        Message::response(to, Payload::ChangedOwner { line, certain, new_owner })
    }

    /// Report that the requested line is unknown here.
    #[must_use]
    pub fn not_found(to: &Message) -> Message {
        let line = Message::request_line(to);
        Message::response(to, Payload::NotFound { line })
    }

    /// Replicate a line write to the designated backup node. The transport
    /// assigns the actual peer; backups start addressed to node 0.
    #[must_use]
    pub fn backup(line: u64, version: u64, data: DataBuf) -> Message {
        Message::request(0, Payload::Backup { line, version, data })
    }

    /// Acknowledge a backed-up line at `version`.
    #[must_use]
    pub fn backupack(peer: i16, line: u64, version: u64) -> Message {
        Message::request(peer, Payload::BackupAck { line, version })
    }

    /// Bundle several backups into one packet. All contained backups share
    /// the packet's destination; [`Message::set_peer`] keeps them in sync.
    ///
    /// # Panics
    ///
    /// Panics if any element of `backups` is not a BACKUP message.
    #[must_use]
    pub fn backup_packet(id: u64, backups: Vec<Message>) -> Message {
        assert!(
            backups.iter().all(|b| matches!(b.payload, Payload::Backup { .. })),
            "backup packet may only contain BACKUP messages"
        );
        Message::request(0, Payload::BackupPacket { id, backups })
    }

    /// Acknowledge a whole backup packet.
    ///
    /// # Panics
    ///
    /// Panics if `to` is not a BACKUP_PACKET.
    #[must_use]
    pub fn backup_packetack(to: &Message) -> Message {
        let id = match to.payload {
            Payload::BackupPacket { id, .. } => id,
            _ => panic!("BACKUP_PACKETACK must respond to a BACKUP_PACKET, got {to}"),
        };
        Message::response(to, Payload::BackupPacketAck { id })
    }

    /// Deliver an application-level datagram bound to `line`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_DATA_LEN`].
    #[must_use]
    pub fn msg(peer: i16, line: u64, data: Bytes) -> Message {
        assert!(
            data.len() <= MAX_DATA_LEN,
            "MSG data of {} bytes exceeds maximum of {}",
            data.len(),
            MAX_DATA_LEN
        );
        Message::request(peer, Payload::Msg { line, data })
    }

    /// Multicast form of [`Message::msg`]. Sorts `peers` in place.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_DATA_LEN`].
    #[must_use]
    pub fn msg_multicast(peers: &mut [i16], line: u64, data: Bytes) -> Message {
        assert!(
            data.len() <= MAX_DATA_LEN,
            "MSG data of {} bytes exceeds maximum of {}",
            data.len(),
            MAX_DATA_LEN
        );
        Message::multicast(peers, Payload::Msg { line, data })
    }

    /// Reply to an application-level datagram.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`MAX_DATA_LEN`].
    #[must_use]
    pub fn msg_response(to: &Message, data: Bytes) -> Message {
        assert!(
            data.len() <= MAX_DATA_LEN,
            "MSG data of {} bytes exceeds maximum of {}",
            data.len(),
            MAX_DATA_LEN
        );
        let line = Message::request_line(to);
        Message::response(to, Payload::Msg { line, data })
    }

    /// Acknowledge receipt of a MSG.
    #[must_use]
    pub fn msgack(to: &Message) -> Message {
        let line = Message::request_line(to);
        Message::response(to, Payload::MsgAck { line })
    }

    /// Synthetic response the transport generates to wake up the waiter on
    /// an expired request. Pairs by message id like any other response.
    #[must_use]
    pub fn timeout(to: &Message) -> Message {
        let line = Message::request_line(to);
        Message::response(to, Payload::Timeout { line })
    }

    /// Transport-level acknowledgement of any request. Never forwarded to
    /// the cache (unlike INVACK).
    #[must_use]
    pub fn ack(to: &Message) -> Message {
        Message::response(to, Payload::Ack)
    }
}

// ── Accessors & transient metadata ────────────────────────────────────────────

impl Message {
    /// The wire tag of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    #[must_use]
    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Assigns the message id. The transport calls this once on first
    /// emission of an outgoing request; responses inherit the id at
    /// construction.
    pub fn set_message_id(&mut self, message_id: i64) {
        self.message_id = message_id;
    }

    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        self.flags.response()
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.flags.broadcast()
    }

    #[must_use]
    pub fn is_reply_required(&self) -> bool {
        self.flags.reply_required()
    }

    /// Clears or sets REPLY_REQUIRED for fire-and-forget sends.
    ///
    /// # Panics
    ///
    /// Panics on an incoming message: received flags are facts, not knobs.
    pub fn set_reply_required(&mut self, value: bool) {
        assert!(
            self.routing.direction == Direction::Outgoing,
            "cannot set reply-required on an incoming message"
        );
        self.flags.set(Flags::REPLY_REQUIRED, value);
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.routing.direction
    }

    /// Marks the message as received. The transport calls this right after
    /// decoding.
    pub fn set_incoming(&mut self) {
        self.routing.direction = Direction::Incoming;
    }

    /// The remote peer: destination for outgoing, source for incoming.
    #[must_use]
    pub fn peer(&self) -> i16 {
        self.routing.peer
    }

    /// Sets the remote peer. On outgoing messages this re-derives the
    /// BROADCAST flag (broadcast iff the peer is −1); on a BACKUP_PACKET it
    /// also rewrites the peer of every contained backup.
    pub fn set_peer(&mut self, peer: i16) {
        self.routing.peer = peer;
        if self.routing.direction == Direction::Outgoing {
            self.flags.set(Flags::BROADCAST, peer == BROADCAST_PEER);
        }
        if let Payload::BackupPacket { backups, .. } = &mut self.payload {
            for backup in backups {
                backup.set_peer(peer);
            }
        }
    }

    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.routing.timestamp_us
    }

    /// Stamps the send or arrival time, in microseconds since the epoch.
    pub fn set_timestamp_us(&mut self, timestamp_us: u64) {
        self.routing.timestamp_us = timestamp_us;
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The cache line this message concerns, if its variant carries one.
    #[must_use]
    pub fn line(&self) -> Option<u64> {
        match self.payload {
            Payload::Get { line }
            | Payload::GetX { line }
            | Payload::Inv { line, .. }
            | Payload::InvAck { line }
            | Payload::Put { line, .. }
            | Payload::PutX { line, .. }
            | Payload::Del { line }
            | Payload::ChangedOwner { line, .. }
            | Payload::NotFound { line }
            | Payload::Timeout { line }
            | Payload::Backup { line, .. }
            | Payload::BackupAck { line, .. }
            | Payload::Msg { line, .. }
            | Payload::MsgAck { line } => Some(line),
            Payload::BackupPacket { .. } | Payload::BackupPacketAck { .. } | Payload::Ack => None,
        }
    }

    /// Number of payload buffers this message carries on the wire.
    #[must_use]
    pub fn num_data_buffers(&self) -> usize {
        match &self.payload {
            Payload::Put { .. } | Payload::PutX { .. } | Payload::Backup { .. } => 1,
            Payload::BackupPacket { backups, .. } => backups.len(),
            _ => 0,
        }
    }

    /// The `index`-th payload buffer.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for this variant.
    #[must_use]
    pub fn data_buffer(&self, index: usize) -> &DataBuf {
        match &self.payload {
            Payload::Put { data, .. } | Payload::PutX { data, .. } | Payload::Backup { data, .. }
                if index == 0 =>
            {
                data
            }
            Payload::BackupPacket { backups, .. } => backups[index].data_buffer(0),
            _ => panic!("message has no payload buffer {index}"),
        }
    }

    pub(crate) fn set_data_buffer(&mut self, index: usize, buf: DataBuf) {
        match &mut self.payload {
            Payload::Put { data, .. } | Payload::PutX { data, .. } | Payload::Backup { data, .. }
                if index == 0 =>
            {
                *data = buf;
            }
            Payload::BackupPacket { backups, .. } => backups[index].set_data_buffer(0, buf),
            _ => panic!("message has no payload buffer {index}"),
        }
    }

    /// Deep-copies every payload buffer into independently-owned storage.
    ///
    /// The transport invokes this when it cannot complete a send before
    /// returning: buffers past the first point into cache-managed storage
    /// and are only stable for the duration of the synchronous send call.
    pub fn clone_data_buffers(&mut self) {
        for i in 0..self.num_data_buffers() {
            let copy = self.data_buffer(i).to_owned_buf();
            self.set_data_buffer(i, copy);
        }
    }

    /// Exact length of the flat-stream encoding.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut len = self.header_len();
        for i in 0..self.num_data_buffers() {
            len += self.data_buffer(i).len();
        }
        len
    }

    /// Length of the header portion: common header, variant body, and the
    /// 2-byte length prefix of each payload buffer, i.e. everything except the
    /// payload bytes themselves. Equal to the first buffer of the
    /// scatter-gather form.
    #[must_use]
    pub fn header_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.payload.body_len() + 2 * self.num_data_buffers()
    }
}

// ── Request/response pairing ──────────────────────────────────────────────────

impl Message {
    /// The hash-bucket key for pending-request lookup.
    ///
    /// Derived from the message id alone so that every candidate pair lands
    /// in the same bucket, where [`Message::pairs_with`] decides.
    #[must_use]
    pub fn pairing_key(&self) -> i64 {
        self.message_id
    }

    /// Whether `other` is the response pairing this request (or vice versa).
    ///
    /// This is not structural equality: it correlates an outgoing request
    /// with an incoming response. The two must travel in opposite directions
    /// with exactly one of them a response and matching message ids. When
    /// both peers are known they must agree; otherwise a broadcast request
    /// pairs a response from any peer.
    #[must_use]
    pub fn pairs_with(&self, other: &Message) -> bool {
        if self.routing.direction == other.routing.direction
            || self.is_response() == other.is_response()
        {
            return false;
        }
        if self.message_id != other.message_id {
            return false;
        }
        if self.routing.peer >= 0 && other.routing.peer >= 0 {
            return self.routing.peer == other.routing.peer;
        }
        self.is_broadcast() != other.is_broadcast()
    }
}

// ── Display ───────────────────────────────────────────────────────────────────

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let incoming = self.routing.direction == Direction::Incoming;
        write!(f, "[{} {} #", self.message_type(), if incoming { "IN" } else { "OUT" })?;
        if self.message_id >= 0 {
            write!(f, "{}", self.message_id)?;
        } else {
            f.write_str("_")?;
        }
        if self.is_response() {
            f.write_str("R")?;
        }
        if incoming && self.is_broadcast() {
            f.write_str(" BCAST")?;
        }
        write!(f, " {} {}", if incoming { "FROM" } else { "TO" }, self.routing.peer)?;
        match &self.payload {
            Payload::Get { line }
            | Payload::GetX { line }
            | Payload::InvAck { line }
            | Payload::Del { line }
            | Payload::NotFound { line }
            | Payload::Timeout { line }
            | Payload::MsgAck { line } => write!(f, ", line: {line:x}")?,
            Payload::Inv { line, previous_owner } => {
                write!(f, ", line: {line:x}, previousOwner: {previous_owner}")?;
            }
            Payload::Put { line, version, data } | Payload::Backup { line, version, data } => {
                write!(f, ", line: {line:x}, version: {version}, data: ({} bytes)", data.len())?;
            }
            Payload::PutX { line, version, sharers, data } => write!(
                f,
                ", line: {line:x}, version: {version}, sharers: {sharers:?}, data: ({} bytes)",
                data.len()
            )?,
            Payload::ChangedOwner { line, certain, new_owner } => {
                write!(f, ", line: {line:x}, newOwner: {new_owner}, certain: {certain}")?;
            }
            Payload::BackupAck { line, version } => {
                write!(f, ", line: {line:x}, version: {version}")?;
            }
            Payload::BackupPacket { id, backups } => {
                write!(f, ", id: {id}, backups: {}", backups.len())?;
            }
            Payload::BackupPacketAck { id } => write!(f, ", id: {id}")?,
            Payload::Msg { line, data } => {
                write!(f, ", line: {line:x}, data: ({} bytes)", data.len())?;
            }
            Payload::Ack => {}
        }
        if !self.is_response() && !self.is_reply_required() {
            f.write_str(" (NO REP REQ)")?;
        }
        f.write_str("]")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(bytes: &[u8]) -> DataBuf {
        DataBuf::Owned(Bytes::copy_from_slice(bytes))
    }

    // ── Tag stability ────────────────────────────────────────────────────────

    #[test]
    fn message_type_tags_are_stable() {
        let expected = [
            (MessageType::Get, 0),
            (MessageType::GetX, 1),
            (MessageType::Inv, 2),
            (MessageType::InvAck, 3),
            (MessageType::Put, 4),
            (MessageType::PutX, 5),
            (MessageType::Del, 6),
            (MessageType::ChangedOwner, 7),
            (MessageType::NotFound, 8),
            (MessageType::Timeout, 9),
            (MessageType::Backup, 10),
            (MessageType::BackupAck, 11),
            (MessageType::BackupPacket, 12),
            (MessageType::BackupPacketAck, 13),
            (MessageType::Msg, 14),
            (MessageType::MsgAck, 15),
            (MessageType::Ack, 16),
        ];
        for (ty, tag) in expected {
            assert_eq!(ty.as_u8(), tag, "{ty} tag drifted");
            assert_eq!(MessageType::try_from(tag), Ok(ty));
        }
        assert_eq!(MessageType::try_from(17), Err(()));
        assert_eq!(MessageType::try_from(99), Err(()));
    }

    #[test]
    fn requires_response_set() {
        for ty in [
            MessageType::Get,
            MessageType::GetX,
            MessageType::Inv,
            MessageType::BackupPacket,
        ] {
            assert!(ty.requires_response());
        }
        for ty in [
            MessageType::Put,
            MessageType::Del,
            MessageType::InvAck,
            MessageType::Msg,
            MessageType::Backup,
            MessageType::Ack,
        ] {
            assert!(!ty.requires_response());
        }
    }

    // ── Constructor flag shapes ──────────────────────────────────────────────

    #[test]
    fn unicast_request_flag_shape() {
        let msg = Message::get(5, 0x100);
        assert_eq!(msg.direction(), Direction::Outgoing);
        assert_eq!(msg.peer(), 5);
        assert_eq!(msg.message_id(), UNASSIGNED_ID);
        assert!(!msg.is_response());
        assert!(!msg.is_broadcast());
        assert!(msg.is_reply_required());
    }

    #[test]
    fn unicast_to_minus_one_is_broadcast() {
        let msg = Message::inv(-1, 7, 3);
        assert!(msg.is_broadcast());
        assert_eq!(msg.peer(), -1);
    }

    #[test]
    fn multicast_sorts_peers_and_clears_broadcast() {
        let mut peers = [9i16, 2, 5];
        let msg = Message::put_multicast(&mut peers, 1, 1, owned(b"x"));
        assert_eq!(peers, [2, 5, 9]);
        assert_eq!(msg.peer(), -1);
        assert!(!msg.is_broadcast());
        assert!(msg.is_reply_required());
    }

    #[test]
    fn response_copies_id_and_peer() {
        let mut get = Message::get(5, 0x100);
        get.set_message_id(42);
        let resp = Message::put_response(&get, 0x100, 7, owned(b"data"));
        assert_eq!(resp.message_id(), 42);
        assert_eq!(resp.peer(), 5);
        assert!(resp.is_response());
        assert!(!resp.is_broadcast());
        assert!(!resp.is_reply_required());
    }

    #[test]
    #[should_panic(expected = "unassigned message id")]
    fn response_to_unassigned_request_panics() {
        let get = Message::get(5, 0x100);
        let _ = Message::not_found(&get);
    }

    #[test]
    #[should_panic(expected = "response line must match")]
    fn response_with_wrong_line_panics() {
        let mut get = Message::get(5, 0x100);
        get.set_message_id(1);
        let _ = Message::put_response(&get, 0x200, 7, owned(b"data"));
    }

    #[test]
    #[should_panic(expected = "sharer list")]
    fn putx_with_oversize_sharer_list_panics() {
        let sharers = vec![1i16; 70_000];
        let _ = Message::putx(3, 1, 1, sharers, owned(b"data"));
    }

    #[test]
    #[should_panic(expected = "MSG data")]
    fn msg_with_oversize_data_panics() {
        let data = Bytes::from(vec![0u8; MAX_DATA_LEN + 1]);
        let _ = Message::msg(3, 1, data);
    }

    #[test]
    #[should_panic(expected = "only contain BACKUP")]
    fn backup_packet_rejects_non_backup() {
        let _ = Message::backup_packet(1, vec![Message::get(0, 1)]);
    }

    #[test]
    #[should_panic(expected = "incoming message")]
    fn set_reply_required_on_incoming_panics() {
        let mut msg = Message::get(5, 1);
        msg.set_incoming();
        msg.set_reply_required(false);
    }

    // ── Transient metadata ───────────────────────────────────────────────────

    #[test]
    fn set_peer_rederives_broadcast_on_outgoing() {
        let mut msg = Message::get(5, 1);
        msg.set_peer(-1);
        assert!(msg.is_broadcast());
        msg.set_peer(3);
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn set_peer_on_incoming_leaves_flags_alone() {
        let mut msg = Message::get(5, 1);
        msg.set_incoming();
        msg.set_peer(-1);
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn backup_packet_peer_rewrites_contained_backups() {
        let backups = vec![
            Message::backup(1, 1, owned(b"a")),
            Message::backup(2, 1, owned(b"b")),
            Message::backup(3, 1, owned(b"c")),
        ];
        let mut packet = Message::backup_packet(99, backups);
        packet.set_peer(7);
        assert_eq!(packet.peer(), 7);
        match packet.payload() {
            Payload::BackupPacket { backups, .. } => {
                for backup in backups {
                    assert_eq!(backup.peer(), 7);
                }
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn timestamp_is_transient_bookkeeping() {
        let mut msg = Message::del(1, 2);
        assert_eq!(msg.timestamp_us(), 0);
        msg.set_timestamp_us(1_700_000_000_000_000);
        assert_eq!(msg.timestamp_us(), 1_700_000_000_000_000);
    }

    // ── Buffer ownership ─────────────────────────────────────────────────────

    #[test]
    fn clone_data_buffers_creates_independent_storage() {
        let original = Bytes::from(vec![0xAA; 64]);
        let original_ptr = original.as_ptr();
        let mut msg = Message::put(1, 2, 3, DataBuf::Borrowed(original));
        msg.clone_data_buffers();

        let buf = msg.data_buffer(0);
        assert!(!buf.is_borrowed());
        assert_ne!(buf.as_slice().as_ptr(), original_ptr);
        assert_eq!(buf.as_slice(), &[0xAA; 64][..]);
    }

    #[test]
    fn shallow_clone_shares_payload_storage() {
        let msg = Message::put(1, 2, 3, owned(&[1, 2, 3, 4]));
        let clone = msg.clone();
        assert_eq!(
            msg.data_buffer(0).as_slice().as_ptr(),
            clone.data_buffer(0).as_slice().as_ptr()
        );
    }

    // ── Pairing ──────────────────────────────────────────────────────────────

    /// Simulates the requester-side view of a response arriving from `peer`.
    fn arriving_response(resp: &Message, peer: i16) -> Message {
        let mut resp = resp.clone();
        resp.set_incoming();
        resp.set_peer(peer);
        resp
    }

    #[test]
    fn unicast_request_pairs_matching_peer() {
        let mut get = Message::get(5, 0x100);
        get.set_message_id(42);
        let put = Message::put_response(&get, 0x100, 1, owned(b"d"));

        assert!(get.pairs_with(&arriving_response(&put, 5)));
        assert!(arriving_response(&put, 5).pairs_with(&get));
        assert!(!get.pairs_with(&arriving_response(&put, 6)));
    }

    #[test]
    fn pairing_requires_matching_ids() {
        let mut get = Message::get(5, 0x100);
        get.set_message_id(42);
        let mut put = Message::put_response(&get, 0x100, 1, owned(b"d"));
        put.set_message_id(43);
        assert!(!get.pairs_with(&arriving_response(&put, 5)));
    }

    #[test]
    fn same_direction_never_pairs() {
        let mut get = Message::get(5, 0x100);
        get.set_message_id(42);
        let put = Message::put_response(&get, 0x100, 1, owned(b"d"));
        // Both still outgoing on this node.
        assert!(!get.pairs_with(&put));
    }

    #[test]
    fn two_requests_never_pair() {
        let mut a = Message::get(5, 1);
        a.set_message_id(1);
        let mut b = Message::getx(5, 1);
        b.set_message_id(1);
        b.set_incoming();
        assert!(!a.pairs_with(&b));
    }

    #[test]
    fn broadcast_request_pairs_response_from_any_peer() {
        let mut inv = Message::inv(-1, 0xABCD, 3);
        inv.set_message_id(7);

        // The responder saw the INV from us and acked it; on our side the
        // ack arrives from peer 9.
        let mut request_at_peer = inv.clone();
        request_at_peer.set_incoming();
        request_at_peer.set_peer(2);
        let invack = Message::invack_response(&request_at_peer);

        let arrived = arriving_response(&invack, 9);
        assert!(inv.pairs_with(&arrived));
        assert_eq!(inv.pairing_key(), arrived.pairing_key());
    }

    #[test]
    fn pairing_key_is_message_id() {
        let mut msg = Message::get(1, 2);
        msg.set_message_id(1234);
        assert_eq!(msg.pairing_key(), 1234);
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    #[test]
    fn line_accessor_by_variant() {
        assert_eq!(Message::get(1, 0x10).line(), Some(0x10));
        assert_eq!(Message::backup(0x20, 1, owned(b"")).line(), Some(0x20));
        let mut get = Message::get(1, 0x10);
        get.set_message_id(0);
        assert_eq!(Message::ack(&get).line(), None);
        assert_eq!(Message::backup_packet(1, Vec::new()).line(), None);
    }

    #[test]
    fn display_renders_compact_summary() {
        let mut get = Message::get(5, 0x100);
        get.set_message_id(42);
        assert_eq!(get.to_string(), "[GET OUT #42 TO 5, line: 100]");

        let mut fire_and_forget = Message::del(3, 0xff);
        fire_and_forget.set_reply_required(false);
        assert_eq!(
            fire_and_forget.to_string(),
            "[DEL OUT #_ TO 3, line: ff (NO REP REQ)]"
        );
    }
}
