//! Session state owned by the client.

use std::collections::{BTreeSet, HashMap};

use apclient_core::ConnectionStatus;
use apclient_transport::{NetworkItem, NetworkPlayer, NetworkVersion, RoomFields};

/// Items received from the server, in arrival order.
///
/// Entries with `location > 0` are unique by `(item, location, player)`.
/// Entries with `location <= 0` come from the server rather than a check
/// and are always appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedItemQueue {
    items: Vec<NetworkItem>,
}

impl ReceivedItemQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `ReceivedItems` batch. Returns how many entries were added.
    pub fn merge<'a>(&mut self, items: impl IntoIterator<Item = &'a NetworkItem>) -> usize {
        let before = self.items.len();
        for item in items {
            if item.location > 0 && self.items.contains(item) {
                continue;
            }
            self.items.push(*item);
        }
        self.items.len() - before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&NetworkItem> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkItem> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Checked and missing location ids of the current slot.
///
/// The two sets stay disjoint; local reports only move ids from missing to
/// checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationSet {
    checked: BTreeSet<i64>,
    missing: BTreeSet<i64>,
}

impl LocationSet {
    #[must_use]
    pub fn new(checked: &[i64], missing: &[i64]) -> Self {
        let checked: BTreeSet<i64> = checked.iter().copied().collect();
        let missing = missing
            .iter()
            .copied()
            .filter(|id| !checked.contains(id))
            .collect();
        Self { checked, missing }
    }

    /// Record locally reported checks.
    pub fn mark_checked(&mut self, ids: &[i64]) {
        for id in ids {
            self.missing.remove(id);
            self.checked.insert(*id);
        }
    }

    #[must_use]
    pub const fn checked(&self) -> &BTreeSet<i64> {
        &self.checked
    }

    #[must_use]
    pub const fn missing(&self) -> &BTreeSet<i64> {
        &self.missing
    }

    /// Number of locations in the slot.
    #[must_use]
    pub fn total(&self) -> usize {
        self.checked.len() + self.missing.len()
    }
}

/// Scouted item at a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoutedItem {
    pub item: i64,
    pub player: i64,
}

/// Scouted locations; the first confirmation for a location wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoutedLocationMap {
    locations: HashMap<i64, ScoutedItem>,
}

impl ScoutedLocationMap {
    /// Merge a `LocationInfo` batch. Already known locations are kept.
    pub fn merge<'a>(&mut self, entries: impl IntoIterator<Item = &'a NetworkItem>) {
        for entry in entries {
            self.locations
                .entry(entry.location)
                .or_insert(ScoutedItem {
                    item: entry.item,
                    player: entry.player,
                });
        }
    }

    #[must_use]
    pub fn get(&self, location: i64) -> Option<&ScoutedItem> {
        self.locations.get(&location)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn clear(&mut self) {
        self.locations.clear();
    }
}

/// Room metadata for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSummary {
    pub server_version: Option<NetworkVersion>,
    pub forfeit_mode: Option<String>,
    pub remaining_mode: Option<String>,
    /// Hint cost as a percentage of the slot's locations.
    pub hint_cost: Option<i64>,
    pub location_check_points: Option<i64>,
    pub hint_points: Option<i64>,
}

impl RoomSummary {
    /// Apply the fields present; absent fields are left unchanged.
    pub fn apply(&mut self, fields: &RoomFields) {
        if let Some(version) = fields.version {
            self.server_version = Some(version);
        }
        if let Some(mode) = &fields.forfeit_mode {
            self.forfeit_mode = Some(capitalize(mode));
        }
        if let Some(mode) = &fields.remaining_mode {
            self.remaining_mode = Some(capitalize(mode));
        }
        if let Some(permissions) = &fields.permissions {
            if let Some(value) = permissions.get("forfeit").or_else(|| permissions.get("release")) {
                self.forfeit_mode = Some(permission_text(*value));
            }
            if let Some(value) = permissions.get("remaining") {
                self.remaining_mode = Some(permission_text(*value));
            }
        }
        if let Some(cost) = fields.hint_cost {
            self.hint_cost = Some(cost);
        }
        if let Some(points) = fields.location_check_points {
            self.location_check_points = Some(points);
        }
        if let Some(points) = fields.hint_points {
            self.hint_points = Some(points);
        }
    }
}

/// Display text for a numeric permission.
#[must_use]
pub fn permission_text(value: i64) -> String {
    match value {
        0 => "Disabled".to_string(),
        1 => "Enabled".to_string(),
        2 => "Goal".to_string(),
        6 => "Auto".to_string(),
        7 => "Enabled + Auto".to_string(),
        other => format!("Unknown ({other})"),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

/// Hint cost in points, rounded half up.
#[must_use]
pub fn hint_cost_points(percent: i64, total_locations: usize) -> i64 {
    let total = i64::try_from(total_locations).unwrap_or(i64::MAX);
    percent
        .saturating_mul(total)
        .saturating_add(50)
        .div_euclid(100)
}

/// The slot authenticated by the last `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: i64,
    pub team: i64,
    pub players: Vec<NetworkPlayer>,
    pub locations: LocationSet,
    /// `StatusUpdate{Goal}` was sent for this slot.
    pub goal_reported: bool,
}

impl SlotInfo {
    /// Alias of the player in `slot`, if known.
    #[must_use]
    pub fn player_alias(&self, slot: i64) -> Option<&str> {
        self.players
            .iter()
            .find(|p| p.slot == slot)
            .map(|p| if p.alias.is_empty() { p.name.as_str() } else { p.alias.as_str() })
    }

    /// Device-side index of a sending player.
    ///
    /// Slot `0` sends items with no human source and maps to the reserved
    /// index one past the last player. Every other slot `p` maps to `p - 1`.
    #[must_use]
    pub fn device_player_index(&self, player: i64) -> i64 {
        if player == 0 {
            i64::try_from(self.players.len()).unwrap_or(i64::MAX)
        } else {
            player.wrapping_sub(1)
        }
    }
}

/// All session-side state, owned by one `SessionClient`.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub status: ConnectionStatus,
    /// The last connection attempt was refused.
    pub auth_error: bool,
    /// Address as entered, for display.
    pub address: Option<String>,
    /// Normalised URL of the last attempt, used for reconnection.
    pub url: Option<String>,
    pub password: Option<String>,
    pub room: RoomSummary,
    pub slot: Option<SlotInfo>,
    pub items: ReceivedItemQueue,
    pub scouted: ScoutedLocationMap,
}

impl SessionState {
    /// Hint cost in points for the current slot.
    #[must_use]
    pub fn hint_cost(&self) -> Option<i64> {
        let percent = self.room.hint_cost?;
        let slot = self.slot.as_ref()?;
        Some(hint_cost_points(percent, slot.locations.total()))
    }
}
