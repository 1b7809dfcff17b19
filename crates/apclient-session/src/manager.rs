//! Client coordinator.
//!
//! One `ClientManager` owns the session, the attached device, the socket and
//! every timer. All mutation happens on the task running [`ClientManager::run`].

use std::sync::Arc;

use apclient_core::{
    ClientContext, ClientStorage, ConsoleStore, DeviceBridge, DeviceConnector, DeviceError,
    StorageError,
};
use apclient_transport::{
    ClientCommand, CloseReason, ConnectionId, SendError, SocketEvent, SocketHandle,
    normalize_address,
};
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};

use crate::{
    client::{Reaction, SessionClient},
    config::ClientConfig,
    reconcile::ReconciliationLoop,
    state::SessionState,
    supervisor::{ReconnectSupervisor, RetryDecision},
};

const DEVICE_FAILURE: &str = "There was a problem communicating with your SNES device. Please ensure it is powered on, the ROM is loaded, and it is connected to your computer.";
const CONNECTION_LOST: &str = "Archipelago server connection lost. The connection closed unexpectedly. Please try to reconnect, or restart the client.";

/// Manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Send error: {0}")]
    Send(#[from] SendError),
}

/// Input from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Connect to `address`. An empty address disconnects.
    Connect {
        address: String,
        password: Option<String>,
    },
    Disconnect,
    Say(String),
    Sync,
    SetReceiveItems(bool),
    Shutdown,
}

/// Opens session sockets.
pub trait SocketFactory: Send + Sync {
    /// Start connecting to `url`. Events for the socket arrive on `events`.
    fn open(
        &self,
        id: ConnectionId,
        url: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketHandle;
}

/// Opens WebSocket session sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketFactory;

impl SocketFactory for WebSocketFactory {
    fn open(
        &self,
        id: ConnectionId,
        url: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketHandle {
        apclient_transport::websocket::connect(id, url.to_string(), events)
    }
}

/// The attached device, if any.
#[derive(Default)]
pub struct DeviceState {
    bridge: Option<Arc<dyn DeviceBridge>>,
    missing_reported: bool,
}

impl DeviceState {
    #[must_use]
    pub const fn is_selected(&self) -> bool {
        self.bridge.is_some()
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.bridge.as_ref().map(|d| d.name())
    }
}

async fn tick_opt(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Coordinates the session socket, the device and the reconciliation tick.
pub struct ClientManager {
    config: ClientConfig,
    client: SessionClient,
    console: Arc<ConsoleStore>,
    connector: Arc<dyn DeviceConnector>,
    factory: Arc<dyn SocketFactory>,
    device: DeviceState,
    socket: Option<SocketHandle>,
    next_id: ConnectionId,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    reconcile: ReconciliationLoop,
    supervisor: ReconnectSupervisor,
    ticker: Option<Interval>,
    reconnect_at: Option<Instant>,
    rediscover_at: Option<Instant>,
    receive_items: bool,
}

impl ClientManager {
    /// Create a new manager.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        ctx: ClientContext,
        connector: Arc<dyn DeviceConnector>,
        factory: Arc<dyn SocketFactory>,
        storage: Arc<dyn ClientStorage>,
        console: Arc<ConsoleStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client: SessionClient::new(ctx, storage, Arc::clone(&console)),
            console,
            connector,
            factory,
            device: DeviceState::default(),
            socket: None,
            next_id: 1,
            events_tx,
            events_rx,
            reconcile: ReconciliationLoop::new(config.layout, config.keepalive_interval),
            supervisor: ReconnectSupervisor::new(
                config.max_reconnect_attempts,
                config.reconnect_delay,
            ),
            ticker: None,
            reconnect_at: None,
            rediscover_at: None,
            receive_items: config.receive_items,
            config,
        }
    }

    #[must_use]
    pub fn console(&self) -> &Arc<ConsoleStore> {
        &self.console
    }

    #[must_use]
    pub const fn session(&self) -> &SessionState {
        self.client.state()
    }

    #[must_use]
    pub const fn device(&self) -> &DeviceState {
        &self.device
    }

    #[must_use]
    pub const fn is_ticking(&self) -> bool {
        self.ticker.is_some()
    }

    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    #[must_use]
    pub const fn rediscovery_pending(&self) -> bool {
        self.rediscover_at.is_some()
    }

    fn socket_open(&self) -> bool {
        self.socket.as_ref().is_some_and(SocketHandle::is_open)
    }

    /// Drive the manager until `Shutdown` or until `commands` closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<UserCommand>) {
        self.discover_device().await;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_user(command) {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                () = tick_opt(self.ticker.as_mut()) => self.on_tick().await,
                () = sleep_opt(self.reconnect_at) => self.on_reconnect_due(),
                () = sleep_opt(self.rediscover_at) => {
                    self.discover_device().await;
                }
            }
        }
        tracing::info!("Client manager stopped");
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    /// Look for a device and attach the first one listed.
    ///
    /// On success the remembered server is reconnected unless an auth error
    /// is pending. On failure another attempt is scheduled.
    pub async fn discover_device(&mut self) -> bool {
        self.rediscover_at = None;
        match self.try_attach().await {
            Ok(device) => {
                tracing::info!(device = device.name(), "Device attached");
                self.console
                    .info(format!("Connected to SNES device {}.", device.name()));
                self.device.bridge = Some(device);
                self.device.missing_reported = false;
                self.resume_session();
                true
            }
            Err(e) => {
                tracing::debug!("No device attached: {e}");
                if !self.device.missing_reported {
                    self.console.info(
                        "Waiting for an SNES device. Make sure SNI is running and the ROM is loaded.",
                    );
                    self.device.missing_reported = true;
                }
                self.rediscover_at = Some(Instant::now() + self.config.device_retry_delay);
                false
            }
        }
    }

    async fn try_attach(&self) -> Result<Arc<dyn DeviceBridge>, DeviceError> {
        let devices = self.connector.list_devices().await?;
        let first = devices.first().ok_or(DeviceError::NoDevice)?;
        self.connector.attach(first).await
    }

    fn resume_session(&mut self) {
        let state = self.client.state();
        if state.auth_error || self.socket_open() {
            return;
        }
        if let Some(url) = state.url.clone() {
            self.open_socket(&url);
        }
    }

    fn open_socket(&mut self, url: &str) {
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!(url, id, "Connecting to server");
        self.client.mark_connecting();
        self.socket = Some(self.factory.open(id, url, self.events_tx.clone()));
    }

    /// Close and forget the current socket. Its late events are ignored.
    fn drop_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
            self.client.on_closed();
        }
        self.ticker = None;
    }

    fn disconnect(&mut self) {
        self.client.forget_server();
        self.reconnect_at = None;
        self.drop_socket();
    }

    fn send(&self, command: ClientCommand) {
        let kind = command.kind();
        match &self.socket {
            Some(socket) if socket.is_open() => {
                if let Err(e) = socket.send(command) {
                    tracing::debug!(cmd = kind, "Dropped outbound command: {e}");
                }
            }
            _ => tracing::debug!(cmd = kind, "No open socket; dropped outbound command"),
        }
    }

    /// Handle one user command. Returns `false` on shutdown.
    pub fn handle_user(&mut self, command: UserCommand) -> bool {
        match command {
            UserCommand::Connect { address, password } => {
                let Some(url) = normalize_address(&address) else {
                    self.disconnect();
                    return true;
                };
                self.drop_socket();
                self.reconnect_at = None;
                self.supervisor.reset();
                self.client.begin_connect(address, url.clone(), password);
                if self.device.is_selected() {
                    self.open_socket(&url);
                } else {
                    self.console.error(
                        "No SNES device is connected. The server will be contacted once one is found.",
                    );
                }
            }
            UserCommand::Disconnect => {
                self.disconnect();
                self.console.info("Disconnected from the server.");
            }
            UserCommand::Say(text) => self.send(ClientCommand::Say { text }),
            UserCommand::Sync => self.send(ClientCommand::Sync),
            UserCommand::SetReceiveItems(enabled) => {
                self.receive_items = enabled;
                self.console.info(if enabled {
                    "Item delivery enabled."
                } else {
                    "Item delivery paused."
                });
            }
            UserCommand::Shutdown => return false,
        }
        true
    }

    /// Handle one socket event. Events from replaced sockets are ignored.
    pub async fn handle_event(&mut self, event: SocketEvent) {
        if self.socket.as_ref().map(SocketHandle::id) != Some(event.connection()) {
            tracing::debug!(id = event.connection(), "Ignoring event from a stale socket");
            return;
        }
        match event {
            SocketEvent::Opened(_) => self.client.on_open(),
            SocketEvent::Batch(_, commands) => {
                let reactions = self.client.handle_batch(commands).await;
                for reaction in reactions {
                    self.apply(reaction).await;
                }
            }
            SocketEvent::Closed(id, reason) => self.on_socket_closed(id, &reason),
        }
    }

    async fn apply(&mut self, reaction: Reaction) {
        match reaction {
            Reaction::Send(command) => self.send(command),
            Reaction::Authenticate => {
                if let Err(e) = self.authenticate().await {
                    self.on_authenticate_failed(e);
                }
            }
            Reaction::SessionStarted => {
                self.supervisor.reset();
                let mut ticker = tokio::time::interval(self.config.tick_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.ticker = Some(ticker);
            }
            Reaction::CloseSocket => {
                if let Some(socket) = &self.socket {
                    socket.close();
                }
            }
        }
    }

    async fn authenticate(&self) -> Result<(), ManagerError> {
        let device = self.device.bridge.as_ref().ok_or(DeviceError::NoDevice)?;
        let layout = self.reconcile.layout();
        let rom_name = device.read(layout.rom_name, layout.rom_name_len).await?;
        let connect = self.client.connect_command(&rom_name).await?;
        let socket = self.socket.as_ref().ok_or(SendError::Closed)?;
        socket.send(connect)?;
        Ok(())
    }

    fn on_authenticate_failed(&mut self, error: ManagerError) {
        match error {
            ManagerError::Device(e) => self.on_device_failure(&e),
            other => {
                tracing::error!("Authentication failed: {other}");
                self.console
                    .error(format!("Could not authenticate with the server: {other}"));
                if let Some(socket) = &self.socket {
                    socket.close();
                }
            }
        }
    }

    fn on_socket_closed(&mut self, id: ConnectionId, reason: &CloseReason) {
        match reason {
            CloseReason::Normal => tracing::info!(id, "Session socket closed"),
            CloseReason::Error(e) => tracing::warn!(id, "Session socket failed: {e}"),
        }
        self.socket = None;
        self.ticker = None;
        self.client.on_closed();

        let state = self.client.state();
        if ReconnectSupervisor::should_schedule(
            self.device.is_selected(),
            state.auth_error,
            state.url.is_some(),
        ) {
            self.reconnect_at = Some(Instant::now() + self.supervisor.delay());
        }
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        let auth_error = self.client.state().auth_error;
        match self.supervisor.on_retry_due(self.socket_open(), auth_error) {
            RetryDecision::Skip => {}
            RetryDecision::GiveUp => {
                tracing::warn!(
                    attempts = self.supervisor.max_attempts(),
                    "Giving up on reconnecting"
                );
                self.console.error(CONNECTION_LOST);
            }
            RetryDecision::Retry { attempt } => {
                let Some(url) = self.client.state().url.clone() else {
                    return;
                };
                self.console.info(format!(
                    "Connection to AP server lost. Attempting to reconnect ({attempt} of {})",
                    self.supervisor.max_attempts()
                ));
                self.open_socket(&url);
            }
        }
    }

    async fn on_tick(&mut self) {
        let Some(device) = self.device.bridge.clone() else {
            self.ticker = None;
            return;
        };
        let result = self
            .reconcile
            .tick(
                device.as_ref(),
                self.socket.as_ref(),
                self.client.state_mut(),
                self.receive_items,
            )
            .await;
        if let Err(e) = result {
            self.on_device_failure(&e);
        }
    }

    fn on_device_failure(&mut self, error: &DeviceError) {
        tracing::error!(device = ?self.device.name(), "Device failure: {error}");
        self.console.error(DEVICE_FAILURE);
        self.ticker = None;
        self.device.bridge = None;
        if let Some(socket) = &self.socket {
            socket.close();
        }
        self.rediscover_at = Some(Instant::now() + self.config.device_retry_delay);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use apclient_core::{ConnectionStatus, ConsoleMsg};
    use apclient_device::{MemoryConnector, MemoryDevice};
    use apclient_transport::{Outbound, decode_batch};
    use tokio_test::assert_ok;

    use super::*;
    use crate::{layout::MemoryLayout, storage::MemoryStorage};

    type Opened = (ConnectionId, String, mpsc::UnboundedReceiver<Outbound>);

    #[derive(Default)]
    struct FakeFactory {
        opened: Mutex<Vec<Opened>>,
        refuse: bool,
    }

    impl FakeFactory {
        fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::default()
            }
        }

        fn urls(&self) -> Vec<String> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .map(|(_, url, _)| url.clone())
                .collect()
        }

        fn outbound(&self, index: usize) -> Vec<Outbound> {
            let mut opened = self.opened.lock().unwrap();
            let rx = &mut opened[index].2;
            let mut out = Vec::new();
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    impl SocketFactory for FakeFactory {
        fn open(
            &self,
            id: ConnectionId,
            url: &str,
            events: mpsc::UnboundedSender<SocketEvent>,
        ) -> SocketHandle {
            let (handle, rx) = SocketHandle::detached(id);
            if self.refuse {
                handle.close();
                let _ = events.send(SocketEvent::Closed(
                    id,
                    CloseReason::Error("connection refused".into()),
                ));
            }
            self.opened.lock().unwrap().push((id, url.to_string(), rx));
            handle
        }
    }

    fn device() -> Arc<MemoryDevice> {
        let device = Arc::new(MemoryDevice::new("mem"));
        device.poke(MemoryLayout::SUPER_METROID.rom_name, b"SM TEST");
        device
    }

    fn manager(factory: &Arc<FakeFactory>, device: &Arc<MemoryDevice>) -> ClientManager {
        ClientManager::new(
            ClientConfig::default(),
            ClientContext::default(),
            Arc::new(MemoryConnector::new([Arc::clone(device)])),
            Arc::clone(factory) as Arc<dyn SocketFactory>,
            Arc::new(MemoryStorage::new()),
            Arc::new(ConsoleStore::new()),
        )
    }

    fn connect(address: &str) -> UserCommand {
        UserCommand::Connect {
            address: address.into(),
            password: None,
        }
    }

    fn batch(id: ConnectionId, frame: &str) -> SocketEvent {
        SocketEvent::Batch(id, assert_ok!(decode_batch(frame)))
    }

    fn has_message(console: &ConsoleStore, text: &str) -> bool {
        console.get_history().iter().any(|m| m.text() == text)
    }

    const ROOM_INFO: &str = r#"[{"cmd":"RoomInfo","version":{"major":0,"minor":3,"build":4},
        "password":false,"hint_cost":20,"datapackage_version":2}]"#;
    const CONNECTED: &str = r#"[{"cmd":"Connected","team":0,"slot":1,"players":[],
        "checked_locations":[],"missing_locations":[82000]}]"#;

    #[tokio::test]
    async fn test_connect_and_authenticate() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        let mut manager = manager(&factory, &device);
        assert!(manager.discover_device().await);

        assert!(manager.handle_user(connect("/connect localhost")));
        assert_eq!(factory.urls(), vec!["ws://localhost:38281".to_string()]);
        assert_eq!(manager.session().status, ConnectionStatus::Connecting);

        manager.handle_event(SocketEvent::Opened(1)).await;
        manager.handle_event(batch(1, ROOM_INFO)).await;
        let sent = factory.outbound(0);
        assert_eq!(sent[0], Outbound::Batch(vec![ClientCommand::GetDataPackage]));
        let Outbound::Batch(connect) = &sent[1] else {
            panic!("expected Connect, got {:?}", sent[1]);
        };
        let ClientCommand::Connect { name, game, .. } = &connect[0] else {
            panic!("expected Connect, got {connect:?}");
        };
        assert_eq!(game, "Super Metroid");
        assert_eq!(name, "U00gVEVTVAAAAAAAAAAAAAAAAAAA");

        manager.handle_event(batch(1, CONNECTED)).await;
        assert!(manager.is_ticking());
        assert_eq!(manager.session().status, ConnectionStatus::Connected);
        assert_eq!(manager.session().hint_cost(), Some(0));
    }

    #[tokio::test]
    async fn test_refusal_suppresses_reconnect() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        let mut manager = manager(&factory, &device);
        manager.discover_device().await;
        manager.handle_user(connect("localhost:1234"));
        manager.handle_event(SocketEvent::Opened(1)).await;
        manager
            .handle_event(batch(
                1,
                r#"[{"cmd":"ConnectionRefused","errors":["InvalidPassword"]}]"#,
            ))
            .await;
        assert!(factory.outbound(0).contains(&Outbound::Close));

        manager
            .handle_event(SocketEvent::Closed(1, CloseReason::Normal))
            .await;
        assert!(!manager.reconnect_pending());
        assert_eq!(manager.session().status, ConnectionStatus::AuthError);
        assert!(has_message(
            manager.console(),
            "A password is required to connect to the server. Please use /connect [server] [password]"
        ));
    }

    #[tokio::test]
    async fn test_stale_socket_events_are_ignored() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        let mut manager = manager(&factory, &device);
        manager.discover_device().await;
        manager.handle_user(connect("first"));
        manager.handle_user(connect("second"));
        assert_eq!(factory.outbound(0), vec![Outbound::Close]);

        manager
            .handle_event(SocketEvent::Closed(1, CloseReason::Normal))
            .await;
        assert!(manager.socket_open());
        assert!(!manager.reconnect_pending());
        assert_eq!(factory.urls()[1], "ws://second:38281");
    }

    #[tokio::test]
    async fn test_empty_address_disconnects() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        let mut manager = manager(&factory, &device);
        manager.discover_device().await;
        manager.handle_user(connect("host"));
        manager.handle_user(connect("  "));

        assert!(!manager.socket_open());
        assert_eq!(manager.session().url, None);
        assert_eq!(factory.urls().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_waits_for_device() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        device.set_available(false);
        let mut manager = manager(&factory, &device);
        assert!(!manager.discover_device().await);
        assert!(manager.rediscovery_pending());

        manager.handle_user(connect("host"));
        assert!(factory.urls().is_empty());

        device.set_available(true);
        assert!(manager.discover_device().await);
        assert_eq!(factory.urls(), vec!["ws://host:38281".to_string()]);
    }

    #[tokio::test]
    async fn test_device_failure_tears_down_and_rediscovers() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        let mut manager = manager(&factory, &device);
        manager.discover_device().await;
        manager.handle_user(connect("host"));
        manager.handle_event(SocketEvent::Opened(1)).await;
        manager.handle_event(batch(1, CONNECTED)).await;
        factory.outbound(0);

        device.set_available(false);
        manager.on_tick().await;
        assert!(!manager.is_ticking());
        assert!(!manager.device().is_selected());
        assert!(manager.rediscovery_pending());
        assert!(factory.outbound(0).contains(&Outbound::Close));
        assert!(has_message(manager.console(), DEVICE_FAILURE));

        // no device, so the close does not schedule a reconnect
        manager
            .handle_event(SocketEvent::Closed(1, CloseReason::Normal))
            .await;
        assert!(!manager.reconnect_pending());

        device.set_available(true);
        assert!(manager.discover_device().await);
        assert_eq!(factory.urls().len(), 2);
        assert_eq!(factory.urls()[1], "ws://host:38281");
    }

    #[tokio::test]
    async fn test_user_commands_need_open_socket() {
        let factory = Arc::new(FakeFactory::default());
        let device = device();
        let mut manager = manager(&factory, &device);
        manager.discover_device().await;
        manager.handle_user(UserCommand::Say("hi".into()));
        manager.handle_user(connect("host"));
        manager.handle_user(UserCommand::Say("hello".into()));
        manager.handle_user(UserCommand::Sync);
        assert_eq!(
            factory.outbound(0),
            vec![
                Outbound::Batch(vec![ClientCommand::Say {
                    text: "hello".into()
                }]),
                Outbound::Batch(vec![ClientCommand::Sync]),
            ]
        );
        assert!(!manager.handle_user(UserCommand::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_ten_attempts() {
        let factory = Arc::new(FakeFactory::refusing());
        let device = device();
        let manager = manager(&factory, &device);
        let console = Arc::clone(manager.console());
        let mut feed = console.get_receiver();
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = async {
            tx.send(connect("host")).unwrap();
            while let Ok(msg) = feed.recv().await {
                if msg == ConsoleMsg::Error(CONNECTION_LOST.to_string()) {
                    break;
                }
            }
            // nothing else is scheduled after giving up
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            tx.send(UserCommand::Shutdown).unwrap();
        };
        tokio::join!(manager.run(rx), driver);

        assert_eq!(factory.urls().len(), 11);
        let progress = console
            .get_history()
            .iter()
            .filter(|m| m.text().starts_with("Connection to AP server lost. Attempting"))
            .count();
        assert_eq!(progress, 10);
        assert!(has_message(
            &console,
            "Connection to AP server lost. Attempting to reconnect (10 of 10)"
        ));
    }
}
