//! Device reconciliation tick.
//!
//! Each tick moves new location checks from device memory to the server and
//! applies at most one received item to the device.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use apclient_core::{DeviceBridge, DeviceError};
use apclient_transport::{ClientCommand, ClientStatus, NetworkItem, SocketHandle};
use tokio::time::Instant;

use crate::{
    layout::{CHECK_RECORD_SIZE, MemoryLayout, RECEIVED_RECORD_SIZE, read_u16},
    state::SessionState,
};

/// Default keep-alive interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5 * 60);

/// Non-reentrant tick flag.
#[derive(Debug, Default)]
pub struct TickGuard {
    busy: AtomicBool,
}

impl TickGuard {
    /// Take the guard, or `None` if a tick is already running.
    pub fn try_acquire(&self) -> Option<TickPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit { guard: self })
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one tick. Released on drop, including on error.
#[derive(Debug)]
pub struct TickPermit<'a> {
    guard: &'a TickGuard,
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub bounced: bool,
    /// The game is in an end-of-game mode; checks and items were skipped.
    pub endgame: bool,
    pub goal_reported: bool,
    /// Location ids sent in `LocationChecks`.
    pub checks: Vec<i64>,
    /// Item written to the device.
    pub delivered: Option<NetworkItem>,
}

/// Polls the device and reconciles it with the session.
#[derive(Debug)]
pub struct ReconciliationLoop {
    layout: MemoryLayout,
    keepalive: Duration,
    last_bounce: Option<Instant>,
    guard: Arc<TickGuard>,
}

impl ReconciliationLoop {
    #[must_use]
    pub fn new(layout: MemoryLayout, keepalive: Duration) -> Self {
        Self {
            layout,
            keepalive,
            last_bounce: None,
            guard: Arc::new(TickGuard::default()),
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// The guard ticks run under.
    #[must_use]
    pub fn guard(&self) -> Arc<TickGuard> {
        Arc::clone(&self.guard)
    }

    /// Run one tick against `device`.
    ///
    /// Returns `Ok(None)` if a previous tick still holds the guard. Commands
    /// are only sent while `socket` is open.
    ///
    /// # Errors
    /// Returns the first device error; the tick is abandoned at that point.
    pub async fn tick(
        &mut self,
        device: &dyn DeviceBridge,
        socket: Option<&SocketHandle>,
        session: &mut SessionState,
        receive_items: bool,
    ) -> Result<Option<TickReport>, DeviceError> {
        let guard = Arc::clone(&self.guard);
        let Some(_permit) = guard.try_acquire() else {
            tracing::trace!("Previous tick still running; skipping");
            return Ok(None);
        };
        let socket = socket.filter(|s| s.is_open());
        let bounced = self.keep_alive(socket, session);

        let mode = device.read(self.layout.game_mode, 1).await?;
        if mode.first().is_some_and(|m| self.layout.is_endgame(*m)) {
            return Ok(Some(TickReport {
                bounced,
                endgame: true,
                goal_reported: Self::report_goal(socket, session),
                ..TickReport::default()
            }));
        }

        let checks = self.report_checks(device, socket, session).await?;
        let delivered = if receive_items {
            self.deliver_item(device, session).await?
        } else {
            None
        };

        Ok(Some(TickReport {
            bounced,
            checks,
            delivered,
            ..TickReport::default()
        }))
    }

    fn keep_alive(&mut self, socket: Option<&SocketHandle>, session: &SessionState) -> bool {
        let (Some(socket), Some(slot)) = (socket, session.slot.as_ref()) else {
            return false;
        };
        let now = Instant::now();
        if self
            .last_bounce
            .is_some_and(|last| now.duration_since(last) <= self.keepalive)
        {
            return false;
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let bounce = ClientCommand::Bounce {
            slots: vec![slot.slot],
            data: millis.into(),
        };
        if socket.send(bounce).is_err() {
            return false;
        }
        self.last_bounce = Some(now);
        true
    }

    fn report_goal(socket: Option<&SocketHandle>, session: &mut SessionState) -> bool {
        let (Some(socket), Some(slot)) = (socket, session.slot.as_mut()) else {
            return false;
        };
        if slot.goal_reported {
            return false;
        }
        let update = ClientCommand::StatusUpdate {
            status: ClientStatus::Goal,
        };
        if socket.send(update).is_err() {
            return false;
        }
        tracing::info!(slot = slot.slot, "Goal reported");
        slot.goal_reported = true;
        true
    }

    async fn report_checks(
        &self,
        device: &dyn DeviceBridge,
        socket: Option<&SocketHandle>,
        session: &mut SessionState,
    ) -> Result<Vec<i64>, DeviceError> {
        let cursor = device.read(self.layout.check_cursor(), 4).await?;
        let check_index = read_u16(&cursor, 0);
        let check_length = read_u16(&cursor, 2);

        let mut ids = Vec::new();
        for index in check_index..check_length {
            let record = device
                .read(self.layout.check_record(index), CHECK_RECORD_SIZE)
                .await?;
            ids.push(self.layout.location_id(&record));
        }
        if ids.is_empty() {
            return Ok(ids);
        }

        // The cursor only advances for checks the server was sent.
        let Some(socket) = socket else {
            tracing::debug!(pending = ids.len(), "Socket closed; leaving checks on device");
            return Ok(Vec::new());
        };
        if socket
            .send(ClientCommand::LocationChecks {
                locations: ids.clone(),
            })
            .is_err()
        {
            return Ok(Vec::new());
        }

        let advanced = check_index.saturating_add(u16::try_from(ids.len()).unwrap_or(u16::MAX));
        device
            .write(self.layout.check_cursor(), &advanced.to_le_bytes())
            .await?;
        if let Some(slot) = session.slot.as_mut() {
            slot.locations.mark_checked(&ids);
        }
        tracing::info!(count = ids.len(), cursor = advanced, "Reported location checks");
        Ok(ids)
    }

    async fn deliver_item(
        &self,
        device: &dyn DeviceBridge,
        session: &SessionState,
    ) -> Result<Option<NetworkItem>, DeviceError> {
        let Some(slot) = session.slot.as_ref() else {
            return Ok(None);
        };
        let counter = device.read(self.layout.received_counter(), 4).await?;
        let count = read_u16(&counter, 2);
        let Some(item) = session.items.get(usize::from(count)).copied() else {
            return Ok(None);
        };
        let Some(next) = count.checked_add(1) else {
            return Ok(None);
        };

        let player = low_u16(slot.device_player_index(item.player));
        let item_id = low_u16(item.item.wrapping_sub(self.layout.items_start_id));
        let mut record = [0u8; RECEIVED_RECORD_SIZE];
        record[..2].copy_from_slice(&player.to_le_bytes());
        record[2..].copy_from_slice(&item_id.to_le_bytes());

        device.write(self.layout.received_record(count), &record).await?;
        device
            .write(self.layout.received_count(), &next.to_le_bytes())
            .await?;
        tracing::debug!(index = count, item = item.item, player = item.player, "Delivered item");
        Ok(Some(item))
    }
}

impl Default for ReconciliationLoop {
    fn default() -> Self {
        Self::new(MemoryLayout::default(), DEFAULT_KEEPALIVE)
    }
}

fn low_u16(value: i64) -> u16 {
    u16::try_from(value & 0xFFFF).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use apclient_device::{DeviceOp, MemoryDevice};
    use apclient_transport::{NetworkPlayer, Outbound};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::state::{LocationSet, SlotInfo};

    const LAYOUT: MemoryLayout = MemoryLayout::SUPER_METROID;

    fn session(players: i64) -> SessionState {
        let players = (1..=players)
            .map(|slot| NetworkPlayer {
                team: 0,
                slot,
                alias: format!("P{slot}"),
                name: String::new(),
            })
            .collect();
        SessionState {
            slot: Some(SlotInfo {
                slot: 1,
                team: 0,
                players,
                locations: LocationSet::new(&[], &[82010, 82011, 82012]),
                goal_reported: false,
            }),
            ..SessionState::default()
        }
    }

    fn sent(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ClientCommand> {
        let mut out = Vec::new();
        while let Ok(Outbound::Batch(batch)) = rx.try_recv() {
            out.extend(batch);
        }
        out
    }

    fn write_check_record(device: &MemoryDevice, index: u16, item_index: u16) {
        let mut record = [0u8; CHECK_RECORD_SIZE];
        record[4..6].copy_from_slice(&(item_index << 3).to_le_bytes());
        device.poke(LAYOUT.check_record(index), &record);
    }

    #[tokio::test]
    async fn test_checks_advance_cursor_by_batch() {
        let device = MemoryDevice::new("mem");
        device.poke(LAYOUT.check_cursor(), &[3, 0, 5, 0]);
        write_check_record(&device, 3, 10);
        write_check_record(&device, 4, 11);
        let (socket, mut rx) = SocketHandle::detached(1);
        let mut session = session(2);
        let mut reconcile = ReconciliationLoop::default();

        let report = reconcile
            .tick(&device, Some(&socket), &mut session, false)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.checks, vec![82010, 82011]);
        assert_eq!(device.peek_u16(LAYOUT.check_cursor()), 5);
        let record_reads = device
            .ops()
            .into_iter()
            .filter(|op| {
                matches!(op, DeviceOp::Read { address, length: CHECK_RECORD_SIZE }
                    if *address >= LAYOUT.check_record(0))
            })
            .count();
        assert_eq!(record_reads, 2);

        let commands = sent(&mut rx);
        let checks: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c, ClientCommand::LocationChecks { .. }))
            .collect();
        assert_eq!(
            checks,
            vec![&ClientCommand::LocationChecks {
                locations: vec![82010, 82011]
            }]
        );
        let slot = session.slot.as_ref().unwrap();
        assert!(slot.locations.checked().contains(&82011));

        // nothing new on the next tick
        let report = reconcile
            .tick(&device, Some(&socket), &mut session, false)
            .await
            .unwrap()
            .unwrap();
        assert!(report.checks.is_empty());
        assert_eq!(device.peek_u16(LAYOUT.check_cursor()), 5);
    }

    #[tokio::test]
    async fn test_checks_wait_for_open_socket() {
        let device = MemoryDevice::new("mem");
        device.poke(LAYOUT.check_cursor(), &[0, 0, 1, 0]);
        write_check_record(&device, 0, 2);
        let mut session = session(1);
        let mut reconcile = ReconciliationLoop::default();

        let report = reconcile.tick(&device, None, &mut session, false).await.unwrap().unwrap();
        assert!(report.checks.is_empty());
        assert_eq!(device.peek_u16(LAYOUT.check_cursor()), 0);

        let (socket, _rx) = SocketHandle::detached(1);
        let report = reconcile
            .tick(&device, Some(&socket), &mut session, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.checks, vec![82002]);
        assert_eq!(device.peek_u16(LAYOUT.check_cursor()), 1);
    }

    #[tokio::test]
    async fn test_goal_sent_once_and_skips_rest() {
        let device = MemoryDevice::new("mem");
        device.poke(LAYOUT.game_mode, &[0x26]);
        device.poke(LAYOUT.check_cursor(), &[0, 0, 1, 0]);
        let (socket, mut rx) = SocketHandle::detached(1);
        let mut session = session(1);
        let mut reconcile = ReconciliationLoop::default();

        for _ in 0..3 {
            let report = reconcile
                .tick(&device, Some(&socket), &mut session, true)
                .await
                .unwrap()
                .unwrap();
            assert!(report.endgame);
            assert!(report.checks.is_empty());
        }
        let goals = sent(&mut rx)
            .into_iter()
            .filter(|c| {
                matches!(c, ClientCommand::StatusUpdate { status: ClientStatus::Goal })
            })
            .count();
        assert_eq!(goals, 1);
        // the cursor was never read
        assert!(!device.ops().iter().any(|op| {
            matches!(op, DeviceOp::Read { address, .. } if *address == LAYOUT.check_cursor())
        }));
    }

    #[tokio::test]
    async fn test_delivers_one_item_per_tick() {
        let device = MemoryDevice::new("mem");
        let mut session = session(3);
        session.items.merge(&[
            NetworkItem {
                item: 83005,
                location: 82001,
                player: 2,
            },
            NetworkItem {
                item: 83007,
                location: -1,
                player: 0,
            },
        ]);
        let mut reconcile = ReconciliationLoop::default();

        let report = reconcile.tick(&device, None, &mut session, true).await.unwrap().unwrap();
        assert_eq!(report.delivered.map(|i| i.item), Some(83005));
        assert_eq!(device.peek(LAYOUT.received_record(0), 4), vec![1, 0, 5, 0]);
        assert_eq!(device.peek_u16(LAYOUT.received_count()), 1);

        let report = reconcile.tick(&device, None, &mut session, true).await.unwrap().unwrap();
        assert_eq!(report.delivered.map(|i| i.item), Some(83007));
        // player 0 maps to the slot after the last player
        assert_eq!(device.peek(LAYOUT.received_record(1), 4), vec![3, 0, 7, 0]);
        assert_eq!(device.peek_u16(LAYOUT.received_count()), 2);

        let report = reconcile.tick(&device, None, &mut session, true).await.unwrap().unwrap();
        assert_eq!(report.delivered, None);
    }

    #[tokio::test]
    async fn test_out_of_range_ids_are_masked() {
        let device = MemoryDevice::new("mem");
        let mut session = session(1);
        session.items.merge(&[NetworkItem {
            item: i64::MIN,
            location: -1,
            player: i64::MIN,
        }]);
        let mut reconcile = ReconciliationLoop::default();

        let report = reconcile.tick(&device, None, &mut session, true).await.unwrap().unwrap();
        assert_eq!(report.delivered.map(|i| i.item), Some(i64::MIN));
        assert_eq!(device.peek(LAYOUT.received_record(0), 4), vec![0xff, 0xff, 0xc8, 0xbb]);
        assert_eq!(device.peek_u16(LAYOUT.received_count()), 1);
    }

    #[tokio::test]
    async fn test_item_delivery_disabled() {
        let device = MemoryDevice::new("mem");
        let mut session = session(1);
        session.items.merge(&[NetworkItem {
            item: 83001,
            location: 5,
            player: 1,
        }]);
        let mut reconcile = ReconciliationLoop::default();
        let report = reconcile.tick(&device, None, &mut session, false).await.unwrap().unwrap();
        assert_eq!(report.delivered, None);
        assert_eq!(device.peek_u16(LAYOUT.received_count()), 0);
    }

    #[tokio::test]
    async fn test_cursor_written_before_item() {
        let device = MemoryDevice::new("mem");
        device.poke(LAYOUT.check_cursor(), &[0, 0, 1, 0]);
        let mut session = session(1);
        session.items.merge(&[NetworkItem {
            item: 83001,
            location: 5,
            player: 1,
        }]);
        let (socket, _rx) = SocketHandle::detached(1);
        let mut reconcile = ReconciliationLoop::default();
        reconcile.tick(&device, Some(&socket), &mut session, true)
            .await
            .unwrap();

        let writes: Vec<_> = device
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                DeviceOp::Write { address, .. } => Some(address),
                DeviceOp::Read { .. } => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                LAYOUT.check_cursor(),
                LAYOUT.received_record(0),
                LAYOUT.received_count()
            ]
        );
    }

    #[tokio::test]
    async fn test_device_failure_aborts_and_releases_guard() {
        let device = MemoryDevice::new("mem");
        device.poke(LAYOUT.check_cursor(), &[0, 0, 2, 0]);
        device.fail_at(LAYOUT.check_record(1));
        let (socket, mut rx) = SocketHandle::detached(1);
        let mut session = session(1);
        let mut reconcile = ReconciliationLoop::default();

        let result = reconcile.tick(&device, Some(&socket), &mut session, true).await;
        assert!(result.is_err());
        assert!(!reconcile.guard().is_busy());
        assert!(!sent(&mut rx)
            .iter()
            .any(|c| matches!(c, ClientCommand::LocationChecks { .. })));
        assert_eq!(device.peek_u16(LAYOUT.check_cursor()), 0);
    }

    #[tokio::test]
    async fn test_held_guard_skips_tick() {
        let device = MemoryDevice::new("mem");
        let mut session = session(1);
        let mut reconcile = ReconciliationLoop::default();
        let guard = reconcile.guard();
        let permit = guard.try_acquire().unwrap();

        assert_eq!(reconcile.tick(&device, None, &mut session, true).await.unwrap(), None);
        assert!(device.ops().is_empty());

        drop(permit);
        assert!(reconcile.tick(&device, None, &mut session, true).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_interval() {
        let device = MemoryDevice::new("mem");
        let (socket, mut rx) = SocketHandle::detached(1);
        let mut session = session(1);
        let mut reconcile = ReconciliationLoop::default();
        let bounces = |rx: &mut UnboundedReceiver<Outbound>| {
            sent(rx)
                .iter()
                .filter(|c| matches!(c, ClientCommand::Bounce { .. }))
                .count()
        };

        reconcile.tick(&device, Some(&socket), &mut session, true).await.unwrap();
        assert_eq!(bounces(&mut rx), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        reconcile.tick(&device, Some(&socket), &mut session, true).await.unwrap();
        assert_eq!(bounces(&mut rx), 0);

        tokio::time::advance(DEFAULT_KEEPALIVE).await;
        reconcile.tick(&device, Some(&socket), &mut session, true).await.unwrap();
        assert_eq!(bounces(&mut rx), 1);
    }
}
