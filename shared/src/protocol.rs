//! Message catalog shared by the server and its clients
//!
//! Client and server discriminants live in separate tables, so the same
//! number may mean different things depending on direction. Delivery
//! policies are declared once here and picked up by both ends through
//! [`register_server_outgoing`] and [`register_client_outgoing`].

use crate::codec::{Serializable, Serializer};
use crate::command::{Delivery, Message, RegistryBuilder};
use crate::error::CodecError;
use crate::math::{Quat, Vec3};

pub const PROTOCOL_VERSION: u32 = 1;

pub const MAX_NAME_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 128;
pub const MAX_CHAT_LEN: usize = 256;
pub const MAX_BATCH_ENTRIES: usize = 4096;
pub const MAX_SNAPSHOT_DELTAS: usize = 64;

/// Upper bound on the delta bytes carried by one snapshot.
pub const SNAPSHOT_PAYLOAD_CEILING: usize = 1300;

/// Session replies and chat.
pub const CHANNEL_SESSION: u8 = 0;
/// Entity creation and deletion batches.
pub const CHANNEL_WORLD: u8 = 1;
/// Per-tick snapshots.
pub const CHANNEL_SNAPSHOT: u8 = 2;
pub const CHANNEL_COUNT: u8 = 3;

/// Data carried by transport disconnects initiated by the server.
pub const DISCONNECT_NORMAL: u32 = 0;
pub const DISCONNECT_PROTOCOL_VIOLATION: u32 = 1;
pub const DISCONNECT_VERSION_MISMATCH: u32 = 2;
pub const DISCONNECT_SHUTDOWN: u32 = 3;

/// Number of client-to-server discriminants.
pub const CLIENT_COMMAND_COUNT: usize = 4;
/// Number of server-to-client discriminants.
pub const SERVER_COMMAND_COUNT: usize = 7;

macro_rules! reason_code {
    ($name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        #[repr(u8)]
        pub enum $name {
            #[default]
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl Serializable for $name {
            fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
                let mut raw = *self as u8;
                s.u8(&mut raw)?;
                *self = $name::from_u8(raw).ok_or(CodecError::InvalidValue {
                    field: stringify!($name),
                    value: u64::from(raw),
                })?;
                Ok(())
            }
        }
    };
}

reason_code!(LoginReason {
    Success = 0,
    InvalidCredentials = 1,
    AlreadyLoggedIn = 2,
    DatabaseError = 3,
    ServerFull = 4,
});

reason_code!(CreateAccountReason {
    Success = 0,
    NameTaken = 1,
    InvalidName = 2,
    DatabaseError = 3,
});

// ---------------------------------------------------------------------------
// Client to server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Login {
    pub username: String,
    pub password: String,
}

impl Serializable for Login {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.string(&mut self.username, MAX_NAME_LEN)?;
        s.string(&mut self.password, MAX_PASSWORD_LEN)
    }
}

impl Message for Login {
    const ID: u8 = 0;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateAccount {
    pub username: String,
    pub password: String,
}

impl Serializable for CreateAccount {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.string(&mut self.username, MAX_NAME_LEN)?;
        s.string(&mut self.password, MAX_PASSWORD_LEN)
    }
}

impl Message for CreateAccount {
    const ID: u8 = 1;
}

/// Control input for the player's ship, stamped with the client clock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerInput {
    pub timestamp: u64,
    pub thrust: Vec3,
    pub torque: Vec3,
}

impl Serializable for PlayerInput {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.var_u64(&mut self.timestamp)?;
        s.value(&mut self.thrust)?;
        s.value(&mut self.torque)
    }
}

impl Message for PlayerInput {
    const ID: u8 = 2;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSend {
    pub text: String,
}

impl Serializable for ChatSend {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.string(&mut self.text, MAX_CHAT_LEN)
    }
}

impl Message for ChatSend {
    const ID: u8 = 3;
}

// ---------------------------------------------------------------------------
// Server to client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginResult {
    pub reason: LoginReason,
    pub player_id: u64,
}

impl Serializable for LoginResult {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.value(&mut self.reason)?;
        s.var_u64(&mut self.player_id)
    }
}

impl Message for LoginResult {
    const ID: u8 = 0;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateAccountResult {
    pub reason: CreateAccountReason,
}

impl Serializable for CreateAccountResult {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.value(&mut self.reason)
    }
}

impl Message for CreateAccountResult {
    const ID: u8 = 1;
}

/// One entity announced in a creation batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCreate {
    pub id: u32,
    pub prefab: u32,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Serializable for EntityCreate {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.var_u32(&mut self.id)?;
        s.var_u32(&mut self.prefab)?;
        s.value(&mut self.position)?;
        s.value(&mut self.rotation)?;
        s.value(&mut self.velocity)?;
        s.value(&mut self.angular_velocity)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCreateBatch {
    pub entries: Vec<EntityCreate>,
}

impl Serializable for EntityCreateBatch {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.list(&mut self.entries, MAX_BATCH_ENTRIES)
    }
}

impl Message for EntityCreateBatch {
    const ID: u8 = 2;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDeleteBatch {
    pub ids: Vec<u32>,
}

impl Serializable for EntityDeleteBatch {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.var_u32_list(&mut self.ids, MAX_BATCH_ENTRIES)
    }
}

impl Message for EntityDeleteBatch {
    const ID: u8 = 3;
}

/// Fixed-size state record for one entity in a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDelta {
    pub id: u32,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
}

impl EntityDelta {
    /// Encoded size in bytes; every field is fixed width.
    pub const ENCODED_SIZE: usize = 4 + 12 + 16 + 12;
}

impl Serializable for EntityDelta {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.u32(&mut self.id)?;
        s.value(&mut self.position)?;
        s.value(&mut self.rotation)?;
        s.value(&mut self.velocity)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub sequence: u32,
    pub server_time: u64,
    pub last_input_time: u64,
    pub deltas: Vec<EntityDelta>,
}

impl Serializable for Snapshot {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.var_u32(&mut self.sequence)?;
        s.var_u64(&mut self.server_time)?;
        s.var_u64(&mut self.last_input_time)?;
        s.list(&mut self.deltas, MAX_SNAPSHOT_DELTAS)
    }
}

impl Message for Snapshot {
    const ID: u8 = 4;
}

/// Tells a client which entity its inputs steer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlEntity {
    pub entity_id: u32,
}

impl Serializable for ControlEntity {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.var_u32(&mut self.entity_id)
    }
}

impl Message for ControlEntity {
    const ID: u8 = 5;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatBroadcast {
    pub sender: String,
    pub text: String,
}

impl Serializable for ChatBroadcast {
    fn serialize(&mut self, s: &mut Serializer<'_>) -> Result<(), CodecError> {
        s.string(&mut self.sender, MAX_NAME_LEN)?;
        s.string(&mut self.text, MAX_CHAT_LEN)
    }
}

impl Message for ChatBroadcast {
    const ID: u8 = 6;
}

/// Declares the delivery policy of every server-to-client message.
pub fn register_server_outgoing<C>(builder: RegistryBuilder<C>) -> RegistryBuilder<C> {
    builder
        .register_outgoing::<LoginResult>("LoginResult", Delivery::Reliable, CHANNEL_SESSION)
        .register_outgoing::<CreateAccountResult>(
            "CreateAccountResult",
            Delivery::Reliable,
            CHANNEL_SESSION,
        )
        .register_outgoing::<EntityCreateBatch>(
            "EntityCreateBatch",
            Delivery::Reliable,
            CHANNEL_WORLD,
        )
        .register_outgoing::<EntityDeleteBatch>(
            "EntityDeleteBatch",
            Delivery::Reliable,
            CHANNEL_WORLD,
        )
        .register_outgoing::<Snapshot>("Snapshot", Delivery::Unreliable, CHANNEL_SNAPSHOT)
        .register_outgoing::<ControlEntity>("ControlEntity", Delivery::Reliable, CHANNEL_WORLD)
        .register_outgoing::<ChatBroadcast>("ChatBroadcast", Delivery::Reliable, CHANNEL_SESSION)
}

/// Declares the delivery policy of every client-to-server message.
pub fn register_client_outgoing<C>(builder: RegistryBuilder<C>) -> RegistryBuilder<C> {
    builder
        .register_outgoing::<Login>("Login", Delivery::Reliable, CHANNEL_SESSION)
        .register_outgoing::<CreateAccount>("CreateAccount", Delivery::Reliable, CHANNEL_SESSION)
        .register_outgoing::<PlayerInput>("PlayerInput", Delivery::Unreliable, CHANNEL_SNAPSHOT)
        .register_outgoing::<ChatSend>("ChatSend", Delivery::Reliable, CHANNEL_SESSION)
}
