//! Protocol constants and payload helpers for LedWiz-family controllers

/// LedWiz vendor ID (shared by clones and the Pinscape firmware)
pub const VENDOR_ID: u16 = 0xFAFA;

/// First product ID of the family; unit number is derived from the PID
pub const PRODUCT_ID_MIN: u16 = 0x00F0;

/// Maximum number of addressable units
pub const MAX_DEVICES: usize = 16;

/// Last product ID of the family
pub const PRODUCT_ID_MAX: u16 = PRODUCT_ID_MIN + MAX_DEVICES as u16 - 1;

/// HID capability filter for genuine controller interfaces
///
/// The controller exposes a single top-level collection with an 8-byte
/// output report. The report-id byte (always zero on the wire) counts
/// toward the reported output length, hence 9.
pub mod caps {
    /// Required number of top-level collections
    pub const COLLECTION_COUNT: u16 = 1;
    /// Required output report byte length (8 payload + 1 report id)
    pub const OUTPUT_REPORT_LEN: u16 = 9;
}

/// Command identifier of an SBA (switch-bank assignment) report
pub const SBA_COMMAND: u8 = 0x40;

/// SBA payload length in bytes
pub const SBA_LEN: usize = 8;

/// PBA payload length in bytes (one value per output)
pub const PBA_LEN: usize = 32;

/// Largest payload accepted for any outgoing report
pub const MAX_WRITE: usize = 32;

/// Largest read the raw-read surface will attempt
pub const MAX_READ: usize = 64;

/// Outgoing queue depth
///
/// The device sustains roughly 2 kByte/s, so 64 chunks is about one
/// second of traffic before producers start blocking.
pub const QUEUE_LEN: usize = 64;

/// Advisory process-scoped lock name shared with other LEDWIZ.DLL ports
pub const PROCESS_SYNC_NAME: &str = "lwz_process_sync_mutex";

/// Per-output profile values accepted by a PBA report
pub mod profile {
    /// Lowest PWM duty value
    pub const PWM_MIN: u8 = 1;
    /// Highest PWM duty value
    pub const PWM_MAX: u8 = 48;
    /// Auto-pulse: ramp up / ramp down
    pub const PULSE_RAMP_UP_DOWN: u8 = 129;
    /// Auto-pulse: on / off
    pub const PULSE_ON_OFF: u8 = 130;
    /// Auto-pulse: on / ramp down
    pub const PULSE_ON_RAMP_DOWN: u8 = 131;
    /// Auto-pulse: ramp up / on
    pub const PULSE_RAMP_UP_ON: u8 = 132;

    /// Check whether a value is a meaningful profile setting
    pub fn is_valid(value: u8) -> bool {
        (PWM_MIN..=PWM_MAX).contains(&value)
            || (PULSE_RAMP_UP_DOWN..=PULSE_RAMP_UP_ON).contains(&value)
    }
}

/// Global pulse speed range carried in an SBA report
pub mod pulse_speed {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 7;
}

/// Write pacing and read timing
pub mod timing {
    use std::time::Duration;

    /// Minimum interval between successive writes to one device.
    /// Matches the controller's documented report rate; the device drops
    /// reports that arrive faster.
    pub const MIN_WRITE_INTERVAL: Duration = Duration::from_millis(10);

    /// Best-effort read timeout
    pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// Product-string token of firmware that needs no pacing at all
    pub const PASSTHROUGH_PRODUCT_TOKEN: &str = "Pinscape Controller";
}

/// Map a product ID onto a registry slot, if it belongs to the family
pub fn slot_for_product_id(product_id: u16) -> Option<usize> {
    if (PRODUCT_ID_MIN..=PRODUCT_ID_MAX).contains(&product_id) {
        Some((product_id - PRODUCT_ID_MIN) as usize)
    } else {
        None
    }
}

/// Map a client unit handle (1..=16) onto a slot index (0..=15)
pub fn slot_for_unit(unit: i32) -> Option<usize> {
    if (1..=MAX_DEVICES as i32).contains(&unit) {
        Some((unit - 1) as usize)
    } else {
        None
    }
}

/// Map a slot index back onto the client-visible unit handle
pub fn unit_for_slot(slot: usize) -> i32 {
    slot as i32 + 1
}

/// Build the 8-byte SBA payload
pub fn sba_payload(bank0: u8, bank1: u8, bank2: u8, bank3: u8, pulse_speed: u8) -> [u8; SBA_LEN] {
    [
        SBA_COMMAND,
        bank0,
        bank1,
        bank2,
        bank3,
        pulse_speed,
        0,
        0,
    ]
}
