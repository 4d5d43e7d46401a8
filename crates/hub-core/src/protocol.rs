use chrono::Utc;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
/// Serialization format version of bulk object payloads relayed by data proxies.
pub const ARCHIVE_VERSION: u32 = 1;

pub type HubId = i32;
pub type ModuleId = i32;

/// Reserved sender/destination ids shared by every node of a session.
pub mod id {
    use super::HubId;

    pub const MODULE_BASE: i32 = 1;
    pub const INVALID: i32 = 0;
    pub const BROADCAST: i32 = -2;
    pub const FOR_BROADCAST: i32 = -3;
    pub const NEXT_HOP: i32 = -4;
    pub const LOCAL_MANAGER: i32 = -6;
    pub const LOCAL_HUB: i32 = -7;
    pub const MASTER_HUB: i32 = -8;

    pub fn is_module(id: i32) -> bool {
        id >= MODULE_BASE
    }

    pub fn is_hub(id: i32) -> bool {
        id <= MASTER_HUB
    }

    /// Id handed to the n-th slave joining the master (n starts at 1).
    pub fn slave_hub(n: u32) -> HubId {
        MASTER_HUB - n as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

/// Peers write the version either as a number or as a string like `"v1"`.
impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(u64),
            Text(String),
        }

        let number = match Wire::deserialize(deserializer)? {
            Wire::Number(number) => number,
            Wire::Text(text) => text
                .trim()
                .trim_start_matches('v')
                .parse::<u64>()
                .map_err(|_| de::Error::custom(format!("bad protocol version {text:?}")))?,
        };
        u16::try_from(number)
            .map(ProtocolVersion)
            .map_err(|_| de::Error::custom(format!("protocol version {number} out of range")))
    }
}

/// Role a peer declares for itself in `Identify`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    /// Asks the receiving side to identify itself.
    Request,
    Unknown,
    Manager,
    /// The master hub, as seen from a slave.
    Hub,
    SlaveHub,
    Ui,
    LocalBulkData,
    RemoteBulkData,
}

impl Identity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Identity::Request => "request",
            Identity::Unknown => "unknown",
            Identity::Manager => "manager",
            Identity::Hub => "hub",
            Identity::SlaveHub => "slave_hub",
            Identity::Ui => "ui",
            Identity::LocalBulkData => "local_bulk_data",
            Identity::RemoteBulkData => "remote_bulk_data",
        }
    }

    pub fn is_hub(&self) -> bool {
        matches!(self, Identity::Hub | Identity::SlaveHub)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: i32,
    #[serde(default = "default_dest")]
    pub dest_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_rank: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<Uuid>,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: Message,
}

fn default_dest() -> i32 {
    id::BROADCAST
}

impl Envelope {
    pub fn new(sender_id: i32, msg: Message) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id,
            dest_id: id::BROADCAST,
            dest_rank: None,
            uuid: None,
            referrer: None,
            timestamp: Utc::now().to_rfc3339(),
            msg,
        }
    }

    pub fn with_dest(mut self, dest_id: i32) -> Self {
        self.dest_id = dest_id;
        self
    }

    pub fn with_rank(mut self, rank: i32) -> Self {
        self.dest_rank = Some(rank);
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_referrer(mut self, referrer: Uuid) -> Self {
        self.referrer = Some(referrer);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.msg.kind()
    }

    /// Number of raw bytes that follow this header on the stream.
    pub fn payload_size(&self) -> u64 {
        match &self.msg {
            Message::SendObject(payload) => payload.payload_size,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    Identify(IdentifyPayload),
    SetId(SetIdPayload),
    Exec(ExecPayload),
    Spawn(SpawnPayload),
    ModuleExit(ModuleExitPayload),
    ModuleAvailable(ModuleAvailablePayload),
    AddHub(AddHubPayload),
    Quit(QuitPayload),
    Barrier(BarrierPayload),
    BarrierReached(BarrierPayload),
    RequestTunnel(RequestTunnelPayload),
    SendObject(SendObjectPayload),
    RequestObject(RequestObjectPayload),
    LockUi(LockUiPayload),
    CloseConnection(CloseConnectionPayload),
    State(StatePayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Identify(_) => MessageKind::Identify,
            Message::SetId(_) => MessageKind::SetId,
            Message::Exec(_) => MessageKind::Exec,
            Message::Spawn(_) => MessageKind::Spawn,
            Message::ModuleExit(_) => MessageKind::ModuleExit,
            Message::ModuleAvailable(_) => MessageKind::ModuleAvailable,
            Message::AddHub(_) => MessageKind::AddHub,
            Message::Quit(_) => MessageKind::Quit,
            Message::Barrier(_) => MessageKind::Barrier,
            Message::BarrierReached(_) => MessageKind::BarrierReached,
            Message::RequestTunnel(_) => MessageKind::RequestTunnel,
            Message::SendObject(_) => MessageKind::SendObject,
            Message::RequestObject(_) => MessageKind::RequestObject,
            Message::LockUi(_) => MessageKind::LockUi,
            Message::CloseConnection(_) => MessageKind::CloseConnection,
            Message::State(_) => MessageKind::State,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identify,
    SetId,
    Exec,
    Spawn,
    ModuleExit,
    ModuleAvailable,
    AddHub,
    Quit,
    Barrier,
    BarrierReached,
    RequestTunnel,
    SendObject,
    RequestObject,
    LockUi,
    CloseConnection,
    State,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        MessageKind::Identify,
        MessageKind::SetId,
        MessageKind::Exec,
        MessageKind::Spawn,
        MessageKind::ModuleExit,
        MessageKind::ModuleAvailable,
        MessageKind::AddHub,
        MessageKind::Quit,
        MessageKind::Barrier,
        MessageKind::BarrierReached,
        MessageKind::RequestTunnel,
        MessageKind::SendObject,
        MessageKind::RequestObject,
        MessageKind::LockUi,
        MessageKind::CloseConnection,
        MessageKind::State,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Identify => "identify",
            MessageKind::SetId => "set_id",
            MessageKind::Exec => "exec",
            MessageKind::Spawn => "spawn",
            MessageKind::ModuleExit => "module_exit",
            MessageKind::ModuleAvailable => "module_available",
            MessageKind::AddHub => "add_hub",
            MessageKind::Quit => "quit",
            MessageKind::Barrier => "barrier",
            MessageKind::BarrierReached => "barrier_reached",
            MessageKind::RequestTunnel => "request_tunnel",
            MessageKind::SendObject => "send_object",
            MessageKind::RequestObject => "request_object",
            MessageKind::LockUi => "lock_ui",
            MessageKind::CloseConnection => "close_connection",
            MessageKind::State => "state",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown message kind '{value}'"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyPayload {
    pub identity: Identity,
    /// Hub id for hubs, rank for local bulk-data peers.
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_version: Option<u32>,
}

impl IdentifyPayload {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            id: id::INVALID,
            name: String::new(),
            archive_version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetIdPayload {
    pub id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecPayload {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub module_id: ModuleId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnPayload {
    pub hub_id: HubId,
    pub module_name: String,
    /// `INVALID` until the master assigns an id.
    #[serde(default)]
    pub spawn_id: ModuleId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleExitPayload {
    pub module_id: ModuleId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleAvailablePayload {
    pub hub_id: HubId,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddHubPayload {
    pub id: HubId,
    pub name: String,
    pub host: String,
    pub control_port: u16,
    pub data_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BarrierPayload {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestTunnelPayload {
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_addr: Option<IpAddr>,
    #[serde(default)]
    pub dest_port: u16,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendObjectPayload {
    pub object_id: String,
    pub payload_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestObjectPayload {
    pub object_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockUiPayload {
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseConnectionPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatePayload {
    pub kind: String,
    #[serde(default)]
    pub body: Value,
}
