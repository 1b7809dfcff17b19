//! Device memory map.
//!
//! Addresses are in the FXPak address space with a LoROM mapping.

use apclient_core::Address;

/// Size of one check record.
pub const CHECK_RECORD_SIZE: usize = 8;

/// Size of one received-item record.
pub const RECEIVED_RECORD_SIZE: usize = 4;

/// Where the game keeps the state the client reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// ROM title, sent base64-encoded as the slot name.
    pub rom_name: Address,
    pub rom_name_len: usize,
    /// One-byte game mode register.
    pub game_mode: Address,
    /// Game modes meaning the goal was reached.
    pub endgame_modes: &'static [u8],
    /// Base of the progress block in SRAM.
    pub progress: Address,
    /// Server id of device location index 0.
    pub locations_start_id: i64,
    /// Server id of device item 0.
    pub items_start_id: i64,
}

const SRAM_START: Address = 0xE0_0000;
const WRAM_START: Address = 0xF5_0000;

impl MemoryLayout {
    /// Super Metroid randomizer layout.
    pub const SUPER_METROID: Self = Self {
        rom_name: 0x00_7FC0,
        rom_name_len: 0x15,
        game_mode: WRAM_START + 0x998,
        endgame_modes: &[0x26, 0x27],
        progress: SRAM_START + 0x2000,
        locations_start_id: 82000,
        items_start_id: 83000,
    };

    /// `(checkIndex, checkLength)` cursor, two `u16 LE`.
    #[must_use]
    pub const fn check_cursor(&self) -> Address {
        self.progress + 0x680
    }

    /// Check record `index`.
    #[must_use]
    pub const fn check_record(&self, index: u16) -> Address {
        self.progress + 0x700 + index as Address * CHECK_RECORD_SIZE as Address
    }

    /// Received-item counter block; the count is the second `u16 LE`.
    #[must_use]
    pub const fn received_counter(&self) -> Address {
        self.progress + 0x600
    }

    /// The writable count half of the received-item counter block.
    #[must_use]
    pub const fn received_count(&self) -> Address {
        self.received_counter() + 2
    }

    /// Received-item record `slot`.
    #[must_use]
    pub const fn received_record(&self, slot: u16) -> Address {
        self.progress + slot as Address * RECEIVED_RECORD_SIZE as Address
    }

    /// Whether `mode` is an end-of-game mode.
    #[must_use]
    pub fn is_endgame(&self, mode: u8) -> bool {
        self.endgame_modes.contains(&mode)
    }

    /// Location id reported for a check record.
    #[must_use]
    pub fn location_id(&self, record: &[u8]) -> i64 {
        let item_index = read_u16(record, 4) >> 3;
        self.locations_start_id + i64::from(item_index)
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::SUPER_METROID
    }
}

/// Little-endian `u16` at `offset`; missing bytes read as zero.
#[must_use]
pub fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let lo = bytes.get(offset).copied().unwrap_or(0);
    let hi = bytes.get(offset + 1).copied().unwrap_or(0);
    u16::from_le_bytes([lo, hi])
}
