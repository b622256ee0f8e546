//! # Shared Protocol Library
//!
//! Everything both ends of a connection must agree on, with no I/O:
//!
//! - [`codec`]: the bidirectional [`Serializer`](codec::Serializer) every
//!   message is traversed with, so encoding and decoding share one code path
//! - [`varint`]: LEB128/ZigZag compressed integers for counts, ids and times
//! - [`command`]: fixed discriminant tables mapping wire ids to decode and
//!   dispatch functions (incoming) and delivery policies (outgoing)
//! - [`protocol`]: the message catalog and channel layout
//! - [`math`]: vector and quaternion types carried by entity state
//!
//! ## Wire Shape
//!
//! ```text
//! [discriminant: u8][field][field]...
//! ```
//!
//! Counts, ids and timestamps inside fields are compressed integers.
//! Discriminant validity is checked before anything else is read.

pub mod codec;
pub mod command;
pub mod error;
pub mod math;
pub mod peer;
pub mod protocol;
pub mod varint;

pub use codec::{Serializable, Serializer};
pub use command::{CommandRegistry, Delivery, EncodedPacket, Handler, Message, RegistryBuilder};
pub use error::CodecError;
pub use math::{Quat, Vec3};
pub use peer::PeerId;
