//! Table-driven command registry
//!
//! Incoming and outgoing messages are identified on the wire by a one-byte
//! discriminant that doubles as the index into a fixed-size table. Both
//! tables are filled once through [`RegistryBuilder`] and are immutable
//! afterwards.
//!
//! Incoming entries store a monomorphized decode-and-dispatch function
//! pointer per message type, so dispatch is an array index plus a direct
//! call into the context's [`Handler`] implementation. Outgoing entries
//! carry the delivery policy and channel, so senders never pick them per
//! call.

use crate::codec::{Serializable, Serializer};
use crate::error::CodecError;
use crate::peer::PeerId;
use thiserror::Error;

/// How the transport delivers an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Delivery {
    /// Acknowledged, retransmitted and delivered in order within its channel.
    Reliable = 0,
    /// Fire and forget; stale packets are discarded on arrival.
    Unreliable = 1,
    /// Fire and forget, delivered in arrival order.
    Unordered = 2,
}

impl Delivery {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Delivery::Reliable),
            1 => Some(Delivery::Unreliable),
            2 => Some(Delivery::Unordered),
            _ => None,
        }
    }
}

/// A wire message with a fixed discriminant.
pub trait Message: Serializable + Default + Clone + Send + 'static {
    const ID: u8;
}

/// Receives decoded messages of type `M`.
pub trait Handler<M: Message> {
    fn handle(&mut self, peer: PeerId, message: M);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command {name} uses discriminant {id} but the table holds {capacity}")]
    OutOfRange {
        name: &'static str,
        id: u8,
        capacity: usize,
    },

    #[error("command {name} reuses discriminant {id} already taken by {existing}")]
    Duplicate {
        name: &'static str,
        id: u8,
        existing: &'static str,
    },
}

type DispatchFn<C> = fn(&mut C, PeerId, &mut Serializer<'_>) -> Result<(), CodecError>;

struct IncomingEntry<C> {
    enabled: bool,
    name: &'static str,
    dispatch: DispatchFn<C>,
}

/// Delivery policy declared for one outgoing message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEntry {
    pub enabled: bool,
    pub name: &'static str,
    pub delivery: Delivery,
    pub channel: u8,
}

/// Encoded bytes together with the declared delivery policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub channel: u8,
    pub delivery: Delivery,
    pub bytes: Vec<u8>,
}

fn dispatch_message<C, M>(
    ctx: &mut C,
    peer: PeerId,
    s: &mut Serializer<'_>,
) -> Result<(), CodecError>
where
    C: Handler<M>,
    M: Message,
{
    let mut message = M::default();
    message.serialize(s)?;
    s.finish()?;
    ctx.handle(peer, message);
    Ok(())
}

/// Writes the discriminant of `M` followed by its fields.
pub fn encode_message<M: Message>(message: &M) -> Result<Vec<u8>, CodecError> {
    let mut copy = message.clone();
    let mut s = Serializer::encoder();
    let mut id = M::ID;
    s.u8(&mut id)?;
    copy.serialize(&mut s)?;
    Ok(s.into_bytes())
}

/// Decodes bytes that must hold exactly one `M`.
pub fn decode_message<M: Message>(bytes: &[u8]) -> Result<M, CodecError> {
    let mut s = Serializer::decoder(bytes);
    let mut id = 0u8;
    s.u8(&mut id)?;
    if id != M::ID {
        return Err(CodecError::UnexpectedCommand {
            expected: M::ID,
            found: id,
        });
    }
    let mut message = M::default();
    message.serialize(&mut s)?;
    s.finish()?;
    Ok(message)
}

/// Reads only the discriminant of an encoded message.
pub fn peek_discriminant(bytes: &[u8]) -> Result<u8, CodecError> {
    bytes.first().copied().ok_or(CodecError::UnexpectedEnd)
}

pub struct RegistryBuilder<C> {
    incoming: Vec<Option<IncomingEntry<C>>>,
    outgoing: Vec<Option<OutgoingEntry>>,
    errors: Vec<RegistryError>,
}

impl<C> RegistryBuilder<C> {
    /// Creates empty tables with room for the given number of discriminants.
    pub fn new(incoming_capacity: usize, outgoing_capacity: usize) -> Self {
        Self {
            incoming: (0..incoming_capacity).map(|_| None).collect(),
            outgoing: (0..outgoing_capacity).map(|_| None).collect(),
            errors: Vec::new(),
        }
    }

    pub fn register_incoming<M: Message>(mut self, name: &'static str) -> Self
    where
        C: Handler<M>,
    {
        let id = M::ID;
        match self.incoming.get_mut(id as usize) {
            None => self.errors.push(RegistryError::OutOfRange {
                name,
                id,
                capacity: self.incoming.len(),
            }),
            Some(Some(existing)) => self.errors.push(RegistryError::Duplicate {
                name,
                id,
                existing: existing.name,
            }),
            Some(slot) => {
                *slot = Some(IncomingEntry {
                    enabled: true,
                    name,
                    dispatch: dispatch_message::<C, M>,
                })
            }
        }
        self
    }

    pub fn register_outgoing<M: Message>(
        mut self,
        name: &'static str,
        delivery: Delivery,
        channel: u8,
    ) -> Self {
        let id = M::ID;
        match self.outgoing.get_mut(id as usize) {
            None => self.errors.push(RegistryError::OutOfRange {
                name,
                id,
                capacity: self.outgoing.len(),
            }),
            Some(Some(existing)) => self.errors.push(RegistryError::Duplicate {
                name,
                id,
                existing: existing.name,
            }),
            Some(slot) => {
                *slot = Some(OutgoingEntry {
                    enabled: true,
                    name,
                    delivery,
                    channel,
                })
            }
        }
        self
    }

    /// Turns a registered incoming command off; decoding it then fails closed.
    pub fn disable_incoming(mut self, id: u8) -> Self {
        if let Some(Some(entry)) = self.incoming.get_mut(id as usize) {
            entry.enabled = false;
        }
        self
    }

    pub fn disable_outgoing(mut self, id: u8) -> Self {
        if let Some(Some(entry)) = self.outgoing.get_mut(id as usize) {
            entry.enabled = false;
        }
        self
    }

    /// Freezes the tables, reporting the first registration mistake.
    pub fn build(self) -> Result<CommandRegistry<C>, RegistryError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }
        Ok(CommandRegistry {
            incoming: self.incoming.into_boxed_slice(),
            outgoing: self.outgoing.into_boxed_slice(),
        })
    }
}

/// Immutable command tables for one side of the protocol.
pub struct CommandRegistry<C> {
    incoming: Box<[Option<IncomingEntry<C>>]>,
    outgoing: Box<[Option<OutgoingEntry>]>,
}

impl<C> CommandRegistry<C> {
    /// Decodes `bytes` and hands the message to `ctx`.
    ///
    /// Fails closed on an out-of-range, unregistered or disabled
    /// discriminant and on malformed payloads; the caller must drop the
    /// connection. Returns the command name on success.
    pub fn dispatch(
        &self,
        ctx: &mut C,
        peer: PeerId,
        bytes: &[u8],
    ) -> Result<&'static str, CodecError> {
        let mut s = Serializer::decoder(bytes);
        let mut id = 0u8;
        s.u8(&mut id)?;

        let entry = match self.incoming.get(id as usize) {
            Some(Some(entry)) if entry.enabled => entry,
            _ => return Err(CodecError::UnknownCommand(id)),
        };

        (entry.dispatch)(ctx, peer, &mut s)?;
        Ok(entry.name)
    }

    /// Encodes `message` and attaches its declared delivery policy.
    pub fn encode<M: Message>(&self, message: &M) -> Result<EncodedPacket, CodecError> {
        let entry = self.outgoing_entry(M::ID)?;
        Ok(EncodedPacket {
            channel: entry.channel,
            delivery: entry.delivery,
            bytes: encode_message(message)?,
        })
    }

    pub fn outgoing_entry(&self, id: u8) -> Result<&OutgoingEntry, CodecError> {
        match self.outgoing.get(id as usize) {
            Some(Some(entry)) if entry.enabled => Ok(entry),
            _ => Err(CodecError::UnknownCommand(id)),
        }
    }

    pub fn incoming_name(&self, id: u8) -> Option<&'static str> {
        self.incoming
            .get(id as usize)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.name)
    }

    pub fn incoming_capacity(&self) -> usize {
        self.incoming.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Move {
        dx: i32,
    }

    impl Serializable for Move {
        fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
            s.var_i32(&mut self.dx)
        }
    }

    impl Message for Move {
        const ID: u8 = 0;
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Say {
        text: String,
    }

    impl Serializable for Say {
        fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
            s.string(&mut self.text, 32)
        }
    }

    impl Message for Say {
        const ID: u8 = 1;
    }

    #[derive(Default)]
    struct Recorder {
        moves: Vec<(PeerId, Move)>,
        said: Vec<(PeerId, Say)>,
    }

    impl Handler<Move> for Recorder {
        fn handle(&mut self, peer: PeerId, message: Move) {
            self.moves.push((peer, message));
        }
    }

    impl Handler<Say> for Recorder {
        fn handle(&mut self, peer: PeerId, message: Say) {
            self.said.push((peer, message));
        }
    }

    fn registry() -> CommandRegistry<Recorder> {
        RegistryBuilder::new(4, 4)
            .register_incoming::<Move>("Move")
            .register_incoming::<Say>("Say")
            .register_outgoing::<Move>("Move", Delivery::Unreliable, 2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_dispatch_routes_by_discriminant() {
        let registry = registry();
        let mut recorder = Recorder::default();

        let bytes = encode_message(&Say {
            text: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(registry.dispatch(&mut recorder, PeerId(4), &bytes), Ok("Say"));

        let bytes = encode_message(&Move { dx: -3 }).unwrap();
        assert_eq!(registry.dispatch(&mut recorder, PeerId(5), &bytes), Ok("Move"));

        assert_eq!(recorder.said[0].0, PeerId(4));
        assert_eq!(recorder.said[0].1.text, "hello");
        assert_eq!(recorder.moves, vec![(PeerId(5), Move { dx: -3 })]);
    }

    #[test]
    fn test_unknown_discriminant_fails_closed() {
        let registry = registry();
        let mut recorder = Recorder::default();

        // Registered range but empty slot.
        assert_eq!(
            registry.dispatch(&mut recorder, PeerId(0), &[2]),
            Err(CodecError::UnknownCommand(2))
        );
        // Beyond the table.
        assert_eq!(
            registry.dispatch(&mut recorder, PeerId(0), &[200, 1, 2]),
            Err(CodecError::UnknownCommand(200))
        );
        assert_eq!(
            registry.dispatch(&mut recorder, PeerId(0), &[]),
            Err(CodecError::UnexpectedEnd)
        );
        assert!(recorder.moves.is_empty());
    }

    #[test]
    fn test_disabled_command_fails_closed() {
        let registry = RegistryBuilder::<Recorder>::new(4, 4)
            .register_incoming::<Move>("Move")
            .disable_incoming(Move::ID)
            .build()
            .unwrap();
        let mut recorder = Recorder::default();
        let bytes = encode_message(&Move { dx: 1 }).unwrap();

        assert_eq!(
            registry.dispatch(&mut recorder, PeerId(0), &bytes),
            Err(CodecError::UnknownCommand(0))
        );
        assert!(recorder.moves.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_not_dispatched() {
        let registry = registry();
        let mut recorder = Recorder::default();
        let mut bytes = encode_message(&Move { dx: 9 }).unwrap();
        bytes.push(0);

        assert_eq!(
            registry.dispatch(&mut recorder, PeerId(0), &bytes),
            Err(CodecError::TrailingBytes(1))
        );
        assert!(recorder.moves.is_empty());
    }

    #[test]
    fn test_encode_uses_declared_policy() {
        let registry = registry();
        let packet = registry.encode(&Move { dx: 1 }).unwrap();
        assert_eq!(packet.channel, 2);
        assert_eq!(packet.delivery, Delivery::Unreliable);
        assert_eq!(packet.bytes[0], Move::ID);

        // Say is incoming only.
        assert_eq!(
            registry.encode(&Say::default()),
            Err(CodecError::UnknownCommand(1))
        );
    }

    #[test]
    fn test_build_rejects_bad_tables() {
        let duplicate = RegistryBuilder::<Recorder>::new(4, 4)
            .register_incoming::<Move>("Move")
            .register_incoming::<Move>("MoveAgain")
            .build();
        assert!(matches!(duplicate, Err(RegistryError::Duplicate { id: 0, .. })));

        let small = RegistryBuilder::<Recorder>::new(1, 1)
            .register_incoming::<Say>("Say")
            .build();
        assert!(matches!(small, Err(RegistryError::OutOfRange { id: 1, .. })));
    }

    #[test]
    fn test_decode_message_checks_discriminant() {
        let bytes = encode_message(&Say::default()).unwrap();
        assert_eq!(
            decode_message::<Move>(&bytes),
            Err(CodecError::UnexpectedCommand {
                expected: 0,
                found: 1
            })
        );
        assert_eq!(decode_message::<Say>(&bytes), Ok(Say::default()));
    }
}
