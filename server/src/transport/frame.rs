//! Datagram frames exchanged by transport hosts

use shared::{CodecError, Serializer};

const KIND_CONNECT: u8 = 0;
const KIND_ACCEPT: u8 = 1;
const KIND_REFUSE: u8 = 2;
const KIND_DISCONNECT: u8 = 3;
const KIND_DISCONNECT_ACK: u8 = 4;
const KIND_PING: u8 = 5;
const KIND_PONG: u8 = 6;
const KIND_RELIABLE: u8 = 7;
const KIND_UNRELIABLE: u8 = 8;
const KIND_UNORDERED: u8 = 9;
const KIND_ACK: u8 = 10;

/// One transport-level datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect {
        token: u32,
        data: u32,
    },
    Accept {
        token: u32,
    },
    Refuse {
        token: u32,
    },
    Disconnect {
        data: u32,
    },
    DisconnectAck,
    Ping {
        time: u32,
    },
    Pong {
        time: u32,
    },
    Reliable {
        channel: u8,
        seq: u32,
        fragment: u32,
        fragment_count: u32,
        payload: Vec<u8>,
    },
    Unreliable {
        channel: u8,
        seq: u32,
        payload: Vec<u8>,
    },
    Unordered {
        channel: u8,
        payload: Vec<u8>,
    },
    Ack {
        channel: u8,
        seq: u32,
    },
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Connect { .. } => KIND_CONNECT,
            Frame::Accept { .. } => KIND_ACCEPT,
            Frame::Refuse { .. } => KIND_REFUSE,
            Frame::Disconnect { .. } => KIND_DISCONNECT,
            Frame::DisconnectAck => KIND_DISCONNECT_ACK,
            Frame::Ping { .. } => KIND_PING,
            Frame::Pong { .. } => KIND_PONG,
            Frame::Reliable { .. } => KIND_RELIABLE,
            Frame::Unreliable { .. } => KIND_UNRELIABLE,
            Frame::Unordered { .. } => KIND_UNORDERED,
            Frame::Ack { .. } => KIND_ACK,
        }
    }

    fn blank(kind: u8) -> Result<Frame, CodecError> {
        let frame = match kind {
            KIND_CONNECT => Frame::Connect { token: 0, data: 0 },
            KIND_ACCEPT => Frame::Accept { token: 0 },
            KIND_REFUSE => Frame::Refuse { token: 0 },
            KIND_DISCONNECT => Frame::Disconnect { data: 0 },
            KIND_DISCONNECT_ACK => Frame::DisconnectAck,
            KIND_PING => Frame::Ping { time: 0 },
            KIND_PONG => Frame::Pong { time: 0 },
            KIND_RELIABLE => Frame::Reliable {
                channel: 0,
                seq: 0,
                fragment: 0,
                fragment_count: 0,
                payload: Vec::new(),
            },
            KIND_UNRELIABLE => Frame::Unreliable {
                channel: 0,
                seq: 0,
                payload: Vec::new(),
            },
            KIND_UNORDERED => Frame::Unordered {
                channel: 0,
                payload: Vec::new(),
            },
            KIND_ACK => Frame::Ack { channel: 0, seq: 0 },
            other => {
                return Err(CodecError::InvalidValue {
                    field: "frame kind",
                    value: u64::from(other),
                })
            }
        };
        Ok(frame)
    }

    fn traverse(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        match self {
            Frame::Connect { token, data } => {
                s.u32(token)?;
                s.var_u32(data)
            }
            Frame::Accept { token } | Frame::Refuse { token } => s.u32(token),
            Frame::Disconnect { data } => s.var_u32(data),
            Frame::DisconnectAck => Ok(()),
            Frame::Ping { time } | Frame::Pong { time } => s.u32(time),
            Frame::Reliable {
                channel,
                seq,
                fragment,
                fragment_count,
                payload,
            } => {
                s.u8(channel)?;
                s.var_u32(seq)?;
                s.var_u32(fragment)?;
                s.var_u32(fragment_count)?;
                s.rest(payload)
            }
            Frame::Unreliable {
                channel,
                seq,
                payload,
            } => {
                s.u8(channel)?;
                s.var_u32(seq)?;
                s.rest(payload)
            }
            Frame::Unordered { channel, payload } => {
                s.u8(channel)?;
                s.rest(payload)
            }
            Frame::Ack { channel, seq } => {
                s.u8(channel)?;
                s.var_u32(seq)
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut copy = self.clone();
        let mut s = Serializer::encoder();
        let mut kind = self.kind();
        s.u8(&mut kind)?;
        copy.traverse(&mut s)?;
        Ok(s.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
        let mut s = Serializer::decoder(bytes);
        let mut kind = 0u8;
        s.u8(&mut kind)?;
        let mut frame = Frame::blank(kind)?;
        frame.traverse(&mut s)?;
        s.finish()?;
        Ok(frame)
    }
}
