//! # galaxy-core
//!
//! Wire-level messaging core for the Galaxy distributed in-memory data grid.
//!
//! Galaxy nodes cooperatively cache fixed-identity "lines" of opaque bytes and
//! coordinate ownership through a closed set of coherence messages (GET, INV,
//! PUT, backup replication, and their acknowledgements). This crate is the
//! layer every other subsystem speaks: the typed message algebra, the binary
//! codec, and the request/response pairing rules.
//!
//! It deliberately contains no I/O, no threads, and no policy. The transport
//! owns sockets, retries, and timeouts; the cache owns the coherence state
//! machine. Both depend on this crate for:
//!
//! - **`protocol::messages`** – message variants, flags, smart constructors,
//!   transient routing metadata, and the pairing predicate that correlates a
//!   response with the request waiting on it.
//!
//! - **`protocol::codec`** – the two wire forms: a flat byte stream (stream
//!   sockets, on-disk logs) and a scatter-gather buffer vector (vectored
//!   writes that emit large payload buffers without copying).
//!
//! - **`protocol::sequence`** – the atomic counter the transport uses to
//!   assign message ids to outgoing requests.

pub mod protocol;

pub use protocol::codec::{
    decode_buffers, decode_flat, encode_buffers, encode_flat, read_flat, write_flat, ProtocolError,
};
pub use protocol::messages::{
    DataBuf, Direction, Flags, Message, MessageType, Payload, MAX_DATA_LEN, MESSAGE_HEADER_LEN,
};
pub use protocol::sequence::MessageIdCounter;
