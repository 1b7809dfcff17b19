//! Session protocol client.
//!
//! Owns the session state and turns inbound server commands into state
//! changes plus [`Reaction`]s for the coordinator to carry out.

use std::sync::Arc;

use apclient_core::{
    ClientContext, ClientStorage, ConnectionStatus, ConsoleMsg, ConsoleStore, StorageError,
    StoredDataPackage,
};
use apclient_transport::{
    ClientCommand, DataPackageData, NetworkPlayer, NetworkVersion, RoomFields, ServerCommand,
};
use base64::Engine as _;
use serde_json::Value;

use crate::{
    datapackage::{DataPackageCache, UNVERSIONED},
    state::{LocationSet, SessionState, SlotInfo},
};

const INVALID_PASSWORD: &str = "InvalidPassword";

/// Context metadata key holding the seed of the current room.
pub const SEED_NAME_KEY: &str = "seed_name";

/// Side effect requested by an inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Send a command on the current socket.
    Send(ClientCommand),
    /// Read the ROM name from the device and send `Connect`.
    Authenticate,
    /// A slot was authenticated; start ticking.
    SessionStarted,
    /// Close the current socket.
    CloseSocket,
}

/// Session-side protocol handler.
pub struct SessionClient {
    ctx: ClientContext,
    state: SessionState,
    cache: DataPackageCache,
    storage: Arc<dyn ClientStorage>,
    console: Arc<ConsoleStore>,
}

impl SessionClient {
    #[must_use]
    pub fn new(
        ctx: ClientContext,
        storage: Arc<dyn ClientStorage>,
        console: Arc<ConsoleStore>,
    ) -> Self {
        Self {
            ctx,
            state: SessionState::default(),
            cache: DataPackageCache::new(),
            storage,
            console,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    pub const fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    #[must_use]
    pub const fn cache(&self) -> &DataPackageCache {
        &self.cache
    }

    #[must_use]
    pub const fn context(&self) -> &ClientContext {
        &self.ctx
    }

    #[must_use]
    pub fn console(&self) -> &Arc<ConsoleStore> {
        &self.console
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.state.status != status {
            self.state.status = status;
            self.console.status(status);
        }
    }

    /// Record a manual connection attempt.
    ///
    /// Clears any pending auth error, since the user asked to try again.
    pub fn begin_connect(&mut self, address: String, url: String, password: Option<String>) {
        self.state.auth_error = false;
        if self.state.status == ConnectionStatus::AuthError {
            self.set_status(ConnectionStatus::Disconnected);
        }
        self.state.address = Some(address);
        self.state.url = Some(url);
        self.state.password = password;
    }

    /// A socket is being opened to the remembered server.
    pub fn mark_connecting(&mut self) {
        self.set_status(ConnectionStatus::Connecting);
    }

    /// Forget the remembered server so no reconnect targets it.
    pub fn forget_server(&mut self) {
        self.state.address = None;
        self.state.url = None;
        self.state.password = None;
    }

    /// The socket opened; the server will re-authenticate us.
    pub fn on_open(&mut self) {
        self.state.items.clear();
        self.set_status(ConnectionStatus::Connecting);
    }

    /// The socket closed.
    pub fn on_closed(&mut self) {
        self.state.slot = None;
        if self.state.status != ConnectionStatus::AuthError {
            self.set_status(ConnectionStatus::Disconnected);
        }
    }

    /// Build `Connect` for the slot named by `rom_name`.
    ///
    /// # Errors
    /// Returns error if the client identity cannot be loaded.
    pub async fn connect_command(&self, rom_name: &[u8]) -> Result<ClientCommand, StorageError> {
        let uuid = self.storage.client_id().await?;
        let version = self.ctx.version;
        Ok(ClientCommand::Connect {
            game: self.ctx.game.clone(),
            name: base64::engine::general_purpose::STANDARD.encode(rom_name),
            uuid,
            tags: self.ctx.tags.clone(),
            password: self.state.password.clone(),
            version: NetworkVersion::new(version.major, version.minor, version.build),
        })
    }

    /// Handle every command of one batch, in order.
    pub async fn handle_batch(&mut self, commands: Vec<ServerCommand>) -> Vec<Reaction> {
        let mut reactions = Vec::new();
        for command in commands {
            reactions.extend(self.handle(command).await);
        }
        reactions
    }

    /// Handle one inbound command.
    pub async fn handle(&mut self, command: ServerCommand) -> Vec<Reaction> {
        tracing::debug!(cmd = command.kind(), "<- server");
        match command {
            ServerCommand::RoomInfo {
                room,
                datapackage_version,
                seed_name,
                ..
            } => self.on_room_info(&room, datapackage_version, seed_name.as_deref()).await,
            ServerCommand::Connected {
                team,
                slot,
                players,
                missing_locations,
                checked_locations,
                hint_points,
            } => self.on_connected(
                team,
                slot,
                players,
                &checked_locations,
                &missing_locations,
                hint_points,
            ),
            ServerCommand::ConnectionRefused { errors } => self.on_refused(&errors),
            ServerCommand::ReceivedItems { items, .. } => {
                let added = self.state.items.merge(&items);
                tracing::debug!(
                    received = items.len(),
                    added,
                    queued = self.state.items.len(),
                    "Merged received items"
                );
                Vec::new()
            }
            ServerCommand::LocationInfo { locations } => {
                self.state.scouted.merge(&locations);
                Vec::new()
            }
            ServerCommand::RoomUpdate { room } => {
                self.state.room.apply(&room);
                Vec::new()
            }
            ServerCommand::Print { text } => {
                self.console.push(ConsoleMsg::Print(text));
                Vec::new()
            }
            ServerCommand::PrintJson { data, .. } => {
                let text = self.render_parts(&data);
                self.console.push(ConsoleMsg::PrintJson {
                    text,
                    data: Value::Array(data),
                });
                Vec::new()
            }
            ServerCommand::DataPackage { data, version } => {
                self.on_data_package(&data, version).await;
                Vec::new()
            }
            ServerCommand::Bounced { .. } => Vec::new(),
            ServerCommand::Unknown => {
                tracing::debug!("Ignoring unknown server command");
                Vec::new()
            }
        }
    }

    async fn on_room_info(
        &mut self,
        room: &RoomFields,
        datapackage_version: Option<i64>,
        seed_name: Option<&str>,
    ) -> Vec<Reaction> {
        self.state.room.apply(room);
        tracing::info!(
            version = ?self.state.room.server_version.map(|v| v.to_string()),
            seed = ?seed_name,
            "Room info received"
        );
        if let Some(seed) = seed_name {
            self.ctx.set_metadata(SEED_NAME_KEY, Value::from(seed));
        }

        let mut reactions = Vec::new();
        let stored = match self.storage.load_data_package().await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Treating cached data package as absent: {e}");
                None
            }
        };

        if DataPackageCache::is_stale(stored.as_ref(), datapackage_version) {
            reactions.push(Reaction::Send(ClientCommand::GetDataPackage));
        } else if let Some(stored) = stored {
            match serde_json::from_value::<DataPackageData>(stored.payload) {
                Ok(data) => self.cache.rebuild(&data, stored.version),
                Err(e) => {
                    tracing::warn!("Cached data package is unreadable: {e}");
                    reactions.push(Reaction::Send(ClientCommand::GetDataPackage));
                }
            }
        }

        reactions.push(Reaction::Authenticate);
        reactions
    }

    fn on_connected(
        &mut self,
        team: i64,
        slot: i64,
        players: Vec<NetworkPlayer>,
        checked: &[i64],
        missing: &[i64],
        hint_points: Option<i64>,
    ) -> Vec<Reaction> {
        self.state.slot = Some(SlotInfo {
            slot,
            team,
            players,
            locations: LocationSet::new(checked, missing),
            goal_reported: false,
        });
        self.state.items.clear();
        self.state.scouted.clear();
        if let Some(points) = hint_points {
            self.state.room.hint_points = Some(points);
        }
        self.set_status(ConnectionStatus::Connected);

        tracing::info!(
            slot,
            team,
            checked = checked.len(),
            missing = missing.len(),
            "Slot authenticated"
        );
        if let Some(cost) = self.state.hint_cost() {
            self.console.info(format!("Connected. Hint cost: {cost} points."));
        } else {
            self.console.info("Connected.");
        }
        vec![Reaction::SessionStarted]
    }

    fn on_refused(&mut self, errors: &[String]) -> Vec<Reaction> {
        if errors.iter().any(|e| e == INVALID_PASSWORD) {
            if self.state.password.is_none() {
                self.console.error(
                    "A password is required to connect to the server. Please use /connect [server] [password]",
                );
            } else {
                self.console.error("The password you provided was rejected by the server.");
            }
        } else {
            self.console.error(format!(
                "Error while connecting to AP server: {}.",
                errors.join(", ")
            ));
        }
        tracing::warn!(?errors, "Connection refused");
        self.state.auth_error = true;
        self.set_status(ConnectionStatus::AuthError);
        vec![Reaction::CloseSocket]
    }

    async fn on_data_package(&mut self, data: &DataPackageData, version: Option<i64>) {
        let version = data.version.or(version).unwrap_or(UNVERSIONED);
        if version != UNVERSIONED {
            match serde_json::to_value(data) {
                Ok(payload) => {
                    let stored = StoredDataPackage { version, payload };
                    if let Err(e) = self.storage.save_data_package(&stored).await {
                        tracing::warn!(version, "Failed to persist data package: {e}");
                    }
                }
                Err(e) => tracing::warn!("Failed to encode data package: {e}"),
            }
        }
        self.cache.rebuild(data, version);
    }

    /// Render `PrintJSON` parts to plain text.
    #[must_use]
    pub fn render_parts(&self, parts: &[Value]) -> String {
        parts.iter().map(|part| self.render_part(part)).collect()
    }

    fn render_part(&self, part: &Value) -> String {
        let text = part.get("text").map_or_else(String::new, |t| match t {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let id = || text.parse::<i64>().ok();
        let resolved = match part.get("type").and_then(Value::as_str) {
            Some("player_id") => id().and_then(|slot| {
                self.state
                    .slot
                    .as_ref()
                    .and_then(|info| info.player_alias(slot))
                    .map(str::to_string)
            }),
            Some("item_id") => id().and_then(|i| self.cache.item_name(i)).map(str::to_string),
            Some("location_id") => id()
                .and_then(|l| self.cache.location_name(l))
                .map(str::to_string),
            _ => None,
        };
        resolved.unwrap_or(text)
    }
}
