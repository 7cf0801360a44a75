//! Device registry
//!
//! Keeps the fixed 16-slot table of attached controllers, keyed by
//! `product_id - PRODUCT_ID_MIN`, and maintains the client-shared device
//! list plus the add/delete notification callbacks. Arrival events trigger
//! a full rescan; removal events probe each occupied slot's stored path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::UsbDevice;
use crate::host::HidHost;
use crate::protocol::{self, caps, timing, MAX_DEVICES};

/// Client-visible unit handle, `1..=16`; 0 is never valid
pub type UnitHandle = i32;

/// Why a notification callback fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NotifyReason {
    Add = 1,
    Delete = 2,
}

/// Notification callback. The extended variant of the C API carried an
/// opaque user pointer; a closure's captures take that role here.
pub type NotifyCallback = Arc<dyn Fn(NotifyReason, UnitHandle) + Send + Sync>;

/// The client-shared device list: a fixed array of unit handles plus a
/// count, written by the registry on attach/detach transitions.
#[derive(Debug, Clone, Copy)]
pub struct DeviceList {
    pub handles: [UnitHandle; MAX_DEVICES],
    pub numdevices: i32,
}

impl DeviceList {
    pub fn new() -> Self {
        Self {
            handles: [0; MAX_DEVICES],
            numdevices: 0,
        }
    }

    /// The currently listed handles
    pub fn handles(&self) -> &[UnitHandle] {
        &self.handles[..self.numdevices as usize]
    }

    pub fn contains(&self, unit: UnitHandle) -> bool {
        self.handles().contains(&unit)
    }

    /// Fresh list behind the shared handle the registry writes to
    pub fn shared() -> SharedDeviceList {
        Arc::new(Mutex::new(Self::new()))
    }
}

impl Default for DeviceList {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a client-shared device list
pub type SharedDeviceList = Arc<Mutex<DeviceList>>;

struct SlotEntry {
    device: Arc<UsbDevice>,
    path: String,
}

/// The 16-slot table plus client callback state
pub(crate) struct Registry {
    slots: [Option<SlotEntry>; MAX_DEVICES],
    list: Option<SharedDeviceList>,
    notify: Option<NotifyCallback>,
    notify_ex: Option<NotifyCallback>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            list: None,
            notify: None,
            notify_ex: None,
        }
    }

    pub(crate) fn device_for_slot(&self, slot: usize) -> Option<Arc<UsbDevice>> {
        self.slots.get(slot)?.as_ref().map(|e| e.device.clone())
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.notify.is_some() || self.notify_ex.is_some()
    }

    /// Snapshot of the callbacks, cloned out so they can be invoked after
    /// the registry borrow is released
    pub(crate) fn callbacks(&self) -> (Option<NotifyCallback>, Option<NotifyCallback>) {
        (self.notify.clone(), self.notify_ex.clone())
    }

    /// Install the simple callback and the client list (which is zeroed)
    pub(crate) fn install_simple(
        &mut self,
        callback: Option<NotifyCallback>,
        list: Option<SharedDeviceList>,
    ) {
        self.notify = callback;
        self.install_list(list);
    }

    /// Install the extended callback and the client list (which is zeroed)
    pub(crate) fn install_extended(
        &mut self,
        callback: Option<NotifyCallback>,
        list: Option<SharedDeviceList>,
    ) {
        self.notify_ex = callback;
        self.install_list(list);
    }

    fn install_list(&mut self, list: Option<SharedDeviceList>) {
        if let Some(list) = &list {
            *list.lock() = DeviceList::new();
        }
        self.list = list;
    }

    /// Release every occupied slot without notifications. Used at teardown
    /// and by `set_notify`, whose rescan then reports every attached device
    /// as newly added.
    pub(crate) fn free_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Enumerate the host and fill empty slots with matching devices.
    /// Returns the slots filled by this scan, in scan order. Notifications
    /// are the caller's job (see [`Registry::add_batch`]).
    pub(crate) fn scan_attached(&mut self, host: &dyn HidHost) -> Vec<usize> {
        let mut new_slots = Vec::new();

        let infos = match host.enumerate() {
            Ok(infos) => infos,
            Err(e) => {
                warn!("device enumeration failed: {e}");
                return new_slots;
            }
        };

        for dev_info in infos {
            if dev_info.vendor_id != protocol::VENDOR_ID {
                continue;
            }
            let Some(slot) = protocol::slot_for_product_id(dev_info.product_id) else {
                continue;
            };
            if self.slots[slot].is_some() {
                // Slot is owned by a physical device until a liveness
                // probe fails; a second unit with the same PID is ignored.
                debug!("slot {slot} already occupied, skipping {}", dev_info.path);
                continue;
            }

            let device = match UsbDevice::open(host, &dev_info.path) {
                Ok(device) => device,
                Err(e) => {
                    debug!("cannot open {}: {e}", dev_info.path);
                    continue;
                }
            };

            let c = device.capabilities();
            if c.collection_count != caps::COLLECTION_COUNT
                || c.output_report_len != caps::OUTPUT_REPORT_LEN
            {
                debug!(
                    "{} has VID/PID of the family but the wrong interface \
                     (collections {}, output len {})",
                    dev_info.path, c.collection_count, c.output_report_len
                );
                continue;
            }

            if device
                .product_string()
                .is_some_and(|s| s.contains(timing::PASSTHROUGH_PRODUCT_TOKEN))
            {
                debug!("{} is pass-through firmware, disabling pacing", dev_info.path);
                device.set_min_write_interval(Duration::ZERO);
            }

            info!(
                "unit {} attached at {}",
                protocol::unit_for_slot(slot),
                dev_info.path
            );
            self.slots[slot] = Some(SlotEntry {
                device,
                path: dev_info.path,
            });
            new_slots.push(slot);
        }

        new_slots
    }

    /// Add a batch of new slots to the client list and report the unit
    /// handles to notify.
    ///
    /// The list must be fully updated before the first Add callback of the
    /// batch fires: some clients read the list only during that first
    /// invocation and ignore every later one.
    pub(crate) fn add_batch(&mut self, new_slots: &[usize]) -> Vec<UnitHandle> {
        if let Some(list) = &self.list {
            let mut list = list.lock();
            for &slot in new_slots {
                let unit = protocol::unit_for_slot(slot);
                if list.contains(unit) {
                    continue;
                }
                let n = list.numdevices as usize;
                if n < MAX_DEVICES {
                    list.handles[n] = unit;
                    list.numdevices += 1;
                }
            }
        }

        new_slots.iter().map(|&s| protocol::unit_for_slot(s)).collect()
    }

    /// Probe every occupied slot's stored path; return the slots whose
    /// device no longer answers.
    pub(crate) fn probe_detached(&self, host: &dyn HidHost) -> Vec<usize> {
        let mut dead = Vec::new();
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some(entry) = entry {
                if !host.probe(&entry.path) {
                    dead.push(slot);
                }
            }
        }
        dead
    }

    /// Drop the slot's device reference. Returns false if the slot was
    /// already empty.
    pub(crate) fn release_slot(&mut self, slot: usize) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.is_some() => {
                info!("unit {} detached", protocol::unit_for_slot(slot));
                *entry = None;
                true
            }
            _ => false,
        }
    }

    /// Remove the slot's unit handle from the client list (swap-with-last)
    pub(crate) fn remove_from_list(&mut self, slot: usize) {
        let unit = protocol::unit_for_slot(slot);
        if let Some(list) = &self.list {
            let mut list = list.lock();
            let mut i = 0;
            while i < list.numdevices as usize {
                if list.handles[i] == unit {
                    let last = list.numdevices as usize - 1;
                    list.handles[i] = list.handles[last];
                    list.handles[last] = 0;
                    list.numdevices -= 1;
                } else {
                    i += 1;
                }
            }
        }
    }
}
