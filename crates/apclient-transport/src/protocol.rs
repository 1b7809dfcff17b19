//! Wire protocol for client-server communication.
//!
//! Every frame is a JSON array of command objects, each tagged by `cmd`.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is not a command batch")]
    NotABatch,
}

/// Version triple as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl NetworkVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

impl std::fmt::Display for NetworkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Outbound version carries a `class` marker the server expects.
#[derive(Serialize)]
struct TaggedVersion {
    major: u32,
    minor: u32,
    build: u32,
    class: &'static str,
}

fn serialize_tagged_version<S: Serializer>(v: &NetworkVersion, s: S) -> Result<S::Ok, S::Error> {
    TaggedVersion {
        major: v.major,
        minor: v.minor,
        build: v.build,
        class: "Version",
    }
    .serialize(s)
}

/// An item sent from `location` by `player`.
///
/// Accepts both the object form `{item, location, player}` and the
/// positional form `[item, location, player]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NetworkItem {
    pub item: i64,
    pub location: i64,
    pub player: i64,
}

impl<'de> Deserialize<'de> for NetworkItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Object { item: i64, location: i64, player: i64 },
            Tuple(i64, i64, i64),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Object {
                item,
                location,
                player,
            }
            | Repr::Tuple(item, location, player) => Self {
                item,
                location,
                player,
            },
        })
    }
}

/// A player in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlayer {
    #[serde(default)]
    pub team: i64,
    pub slot: i64,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub name: String,
}

/// Room metadata shared by `RoomInfo` and `RoomUpdate`.
///
/// Every field is optional: `RoomUpdate` carries only what changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomFields {
    #[serde(default)]
    pub version: Option<NetworkVersion>,
    #[serde(default)]
    pub forfeit_mode: Option<String>,
    #[serde(default)]
    pub remaining_mode: Option<String>,
    #[serde(default)]
    pub permissions: Option<HashMap<String, i64>>,
    #[serde(default)]
    pub hint_cost: Option<i64>,
    #[serde(default)]
    pub location_check_points: Option<i64>,
    #[serde(default)]
    pub hint_points: Option<i64>,
}

/// Per-game name/id tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameData {
    #[serde(default)]
    pub item_name_to_id: HashMap<String, i64>,
    #[serde(default)]
    pub location_name_to_id: HashMap<String, i64>,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Body of a `DataPackage` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPackageData {
    #[serde(default)]
    pub games: HashMap<String, GameData>,
    #[serde(default)]
    pub version: Option<i64>,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd")]
pub enum ServerCommand {
    RoomInfo {
        #[serde(flatten)]
        room: RoomFields,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        password: bool,
        #[serde(default)]
        datapackage_version: Option<i64>,
        #[serde(default)]
        seed_name: Option<String>,
    },
    Connected {
        team: i64,
        slot: i64,
        #[serde(default)]
        players: Vec<NetworkPlayer>,
        #[serde(default)]
        missing_locations: Vec<i64>,
        #[serde(default)]
        checked_locations: Vec<i64>,
        #[serde(default)]
        hint_points: Option<i64>,
    },
    ConnectionRefused {
        #[serde(default)]
        errors: Vec<String>,
    },
    ReceivedItems {
        #[serde(default)]
        index: Option<i64>,
        items: Vec<NetworkItem>,
    },
    LocationInfo {
        locations: Vec<NetworkItem>,
    },
    RoomUpdate {
        #[serde(flatten)]
        room: RoomFields,
    },
    Print {
        text: String,
    },
    #[serde(rename = "PrintJSON")]
    PrintJson {
        data: Vec<Value>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
    DataPackage {
        data: DataPackageData,
        #[serde(default)]
        version: Option<i64>,
    },
    Bounced {
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Unknown,
}

impl ServerCommand {
    /// Discriminator name, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RoomInfo { .. } => "RoomInfo",
            Self::Connected { .. } => "Connected",
            Self::ConnectionRefused { .. } => "ConnectionRefused",
            Self::ReceivedItems { .. } => "ReceivedItems",
            Self::LocationInfo { .. } => "LocationInfo",
            Self::RoomUpdate { .. } => "RoomUpdate",
            Self::Print { .. } => "Print",
            Self::PrintJson { .. } => "PrintJSON",
            Self::DataPackage { .. } => "DataPackage",
            Self::Bounced { .. } => "Bounced",
            Self::Unknown => "Unknown",
        }
    }
}

/// Client progress reported with `StatusUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Unknown = 0,
    Ready = 10,
    Playing = 20,
    Goal = 30,
}

impl Serialize for ClientStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd")]
pub enum ClientCommand {
    Connect {
        game: String,
        name: String,
        uuid: String,
        tags: Vec<String>,
        password: Option<String>,
        #[serde(serialize_with = "serialize_tagged_version")]
        version: NetworkVersion,
    },
    LocationChecks {
        locations: Vec<i64>,
    },
    StatusUpdate {
        status: ClientStatus,
    },
    Bounce {
        slots: Vec<i64>,
        data: Value,
    },
    Sync,
    GetDataPackage,
    Say {
        text: String,
    },
}

impl ClientCommand {
    /// Discriminator name, for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::LocationChecks { .. } => "LocationChecks",
            Self::StatusUpdate { .. } => "StatusUpdate",
            Self::Bounce { .. } => "Bounce",
            Self::Sync => "Sync",
            Self::GetDataPackage => "GetDataPackage",
            Self::Say { .. } => "Say",
        }
    }
}

/// Encode outbound commands as one frame.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_batch(commands: &[ClientCommand]) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(commands)?)
}

/// Decode an inbound frame.
///
/// A malformed element is logged and skipped; the rest of the batch is
/// still returned.
///
/// # Errors
/// Returns error if the frame is not JSON or not an array.
pub fn decode_batch(frame: &str) -> Result<Vec<ServerCommand>, ProtocolError> {
    let Value::Array(elements) = serde_json::from_str::<Value>(frame)? else {
        return Err(ProtocolError::NotABatch);
    };

    let mut commands = Vec::with_capacity(elements.len());
    for element in elements {
        let cmd = element
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_string();
        match serde_json::from_value::<ServerCommand>(element) {
            Ok(command) => commands.push(command),
            Err(e) => tracing::warn!(cmd = %cmd, "Ignoring malformed server command: {e}"),
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;

    #[test]
    fn test_decode_connected() {
        let frame = r#"[{"cmd":"Connected","team":0,"slot":2,
            "players":[{"team":0,"slot":1,"alias":"A","name":"A"},{"team":0,"slot":2,"alias":"B","name":"B"}],
            "checked_locations":[5,9],"missing_locations":[1,2,3]}]"#;
        let cmds = assert_ok!(decode_batch(frame));
        let ServerCommand::Connected {
            slot,
            players,
            checked_locations,
            missing_locations,
            ..
        } = &cmds[0]
        else {
            panic!("Wrong command");
        };
        assert_eq!(*slot, 2);
        assert_eq!(players.len(), 2);
        assert_eq!(checked_locations, &vec![5, 9]);
        assert_eq!(missing_locations, &vec![1, 2, 3]);
    }

    #[test]
    fn test_network_item_both_forms() {
        let frame = r#"[
            {"cmd":"ReceivedItems","index":0,"items":[{"item":7,"location":12,"player":1}]},
            {"cmd":"LocationInfo","locations":[[83001,82005,3]]}
        ]"#;
        let cmds = assert_ok!(decode_batch(frame));
        assert_eq!(
            cmds[0],
            ServerCommand::ReceivedItems {
                index: Some(0),
                items: vec![NetworkItem {
                    item: 7,
                    location: 12,
                    player: 1
                }],
            }
        );
        assert_eq!(
            cmds[1],
            ServerCommand::LocationInfo {
                locations: vec![NetworkItem {
                    item: 83001,
                    location: 82005,
                    player: 3
                }],
            }
        );
    }

    #[test]
    fn test_unknown_and_malformed_are_isolated() {
        let frame = r#"[
            {"cmd":"InvalidPacket","text":"?"},
            {"cmd":"ReceivedItems","items":"not a list"},
            {"cmd":"Print","text":"hello"}
        ]"#;
        let cmds = assert_ok!(decode_batch(frame));
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], ServerCommand::Unknown);
        assert_eq!(
            cmds[1],
            ServerCommand::Print {
                text: "hello".into()
            }
        );
    }

    #[test]
    fn test_non_array_frame_rejected() {
        assert!(matches!(
            decode_batch(r#"{"cmd":"Print","text":"x"}"#),
            Err(ProtocolError::NotABatch)
        ));
        assert!(matches!(decode_batch("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_room_update_partial() {
        let cmds = decode_batch(r#"[{"cmd":"RoomUpdate","hint_points":4}]"#).unwrap();
        let ServerCommand::RoomUpdate { room } = &cmds[0] else {
            panic!("Wrong command");
        };
        assert_eq!(room.hint_points, Some(4));
        assert_eq!(room.hint_cost, None);
        assert_eq!(room.version, None);
    }

    #[test]
    fn test_data_package_version_locations() {
        let frame = r#"[{"cmd":"DataPackage","data":{"version":3,"games":{
            "Super Metroid":{"item_name_to_id":{"Missile":83000},"location_name_to_id":{"Morph Ball":82000}}}}}]"#;
        let cmds = assert_ok!(decode_batch(frame));
        let ServerCommand::DataPackage { data, version } = &cmds[0] else {
            panic!("Wrong command");
        };
        assert_eq!(data.version, Some(3));
        assert_eq!(*version, None);
        assert_eq!(data.games["Super Metroid"].item_name_to_id["Missile"], 83000);
    }

    #[test]
    fn test_encode_connect() {
        let cmd = ClientCommand::Connect {
            game: "Super Metroid".into(),
            name: "QVA=".into(),
            uuid: "id".into(),
            tags: vec!["Super Metroid Client".into()],
            password: None,
            version: NetworkVersion::new(0, 1, 9),
        };
        let value: Value = serde_json::from_str(&encode_batch(&[cmd]).unwrap()).unwrap();
        assert_eq!(
            value,
            json!([{
                "cmd": "Connect",
                "game": "Super Metroid",
                "name": "QVA=",
                "uuid": "id",
                "tags": ["Super Metroid Client"],
                "password": null,
                "version": {"major": 0, "minor": 1, "build": 9, "class": "Version"},
            }])
        );
    }

    #[test]
    fn test_encode_unit_and_status() {
        let frame = encode_batch(&[
            ClientCommand::Sync,
            ClientCommand::StatusUpdate {
                status: ClientStatus::Goal,
            },
        ])
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!([{"cmd": "Sync"}, {"cmd": "StatusUpdate", "status": 30}])
        );
    }
}
