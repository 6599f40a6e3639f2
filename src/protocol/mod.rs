//! Coherence protocol message types and the binary codec.
//!
//! Every message shares a 10-byte common header on the wire:
//!
//! ```text
//! [tag:1][message_id:8][flags:1]
//! ```
//!
//! followed by a variant-specific body and, for payload-carrying variants,
//! the payload buffers. All multibyte integers are big-endian. There are two
//! distinct wire forms, a flat stream and a scatter-gather buffer vector,
//! which are **not** interchangeable; see [`codec`] for the layouts.
//!
//! # Sub-modules
//!
//! - **`messages`** – message variants, flags, constructors, pairing.
//! - **`codec`**    – encoding and decoding for both wire forms.
//! - **`sequence`** – atomic message-id counter for outgoing requests.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{
    decode_buffers, decode_flat, encode_buffers, encode_flat, read_flat, write_flat, ProtocolError,
};
pub use messages::{DataBuf, Direction, Flags, Message, MessageType, Payload};
pub use sequence::MessageIdCounter;
