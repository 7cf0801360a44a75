//! User-space shim for LedWiz-family USB HID output controllers
//!
//! The controller family (lighting / solenoid drivers, up to 16 addressable
//! units) accepts two principal command families: SBA sets the on/off state
//! of all 32 outputs in one report, PBA sets the 32 per-output
//! brightness/profile values. This crate offers a stable synchronous API
//! for both while decoupling callers from USB write latency:
//!
//! ```text
//! caller ──► LedWiz (unit lookup) ──► WriteQueue (coalescing ring)
//!                                          │
//!                                   writer thread ──► UsbDevice (paced) ──► HidHost
//! ```
//!
//! Hot-plug arrivals and removals come in through a host-provided
//! [`EventSink`]; the registry keeps a 16-slot table keyed by product ID
//! and notifies the client through its registered callbacks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledwiz::{DeviceList, LedWiz, NotifyCallback};
//!
//! let lw = LedWiz::open_default()?;
//!
//! let list = DeviceList::shared();
//! let callback: NotifyCallback = Arc::new(|reason, unit| {
//!     println!("unit {unit}: {reason:?}");
//! });
//! lw.set_notify(Some(callback), Some(list.clone()));
//!
//! // All outputs of unit 1 on, pulse speed 2
//! lw.sba(1, 0xFF, 0xFF, 0xFF, 0xFF, 2);
//! lw.close();
//! # Ok::<(), ledwiz::Error>(())
//! ```

pub mod device;
pub mod error;
pub mod host;
pub mod hotplug;
pub mod protocol;
pub mod registry;

mod queue;

pub use device::UsbDevice;
pub use error::Error;
pub use host::{HidCapabilities, HidDeviceInfo, HidEndpoint, HidHost, HidapiHost};
pub use hotplug::{EventHandler, EventSink, HotplugEvent, ManualSink};
pub use registry::{
    DeviceList, NotifyCallback, NotifyReason, SharedDeviceList, UnitHandle,
};

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::protocol::{MAX_READ, MAX_WRITE, PBA_LEN};
use crate::queue::{ChunkKind, WriteQueue};
use crate::registry::Registry;

/// The shim context. One per host process is typical, but nothing prevents
/// more; an advisory counter tracks concurrent instances.
///
/// All operations are synchronous and thread-safe. Client callbacks are
/// invoked while the context lock is held; the lock is reentrant, so a
/// callback may call back into the API from the same thread.
pub struct LedWiz {
    core: Arc<Core>,
}

struct Core {
    host: Arc<dyn HidHost>,
    queue: WriteQueue,
    cs: ReentrantMutex<RefCell<State>>,
    closed: AtomicBool,
}

struct State {
    registry: Registry,
    hotplug: Option<HotplugRegistration>,
}

struct HotplugRegistration {
    sink: Arc<dyn EventSink>,
    handler: Arc<ShimHandler>,
}

impl LedWiz {
    /// Create a context over the given host seam and start the writer
    pub fn open(host: Arc<dyn HidHost>) -> Self {
        instances::acquire();
        Self {
            core: Arc::new(Core {
                host,
                queue: WriteQueue::open(),
                cs: ReentrantMutex::new(RefCell::new(State {
                    registry: Registry::new(),
                    hotplug: None,
                })),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a context over the platform HID stack
    pub fn open_default() -> Result<Self, Error> {
        Ok(Self::open(Arc::new(HidapiHost::new()?)))
    }

    /// Set the on/off state of all outputs plus the global pulse speed.
    ///
    /// `bank0..bank3` are 8-bit masks for outputs 1-8, 9-16, 17-24, 25-32;
    /// `pulse_speed` is 1..=7. No-op when the unit is not attached.
    pub fn sba(
        &self,
        unit: UnitHandle,
        bank0: u8,
        bank1: u8,
        bank2: u8,
        bank3: u8,
        pulse_speed: u8,
    ) {
        trace!(
            "sba unit={unit} banks=[{bank0:02x} {bank1:02x} {bank2:02x} {bank3:02x}] \
             speed={pulse_speed}"
        );
        let Some(device) = self.device_for(unit) else {
            return;
        };
        let payload = protocol::sba_payload(bank0, bank1, bank2, bank3, pulse_speed);
        if self.core.queue.push(Some(device), ChunkKind::Sba, &payload) == 0 {
            debug!("sba dropped: {}", Error::QueueShutDown);
        }
    }

    /// Set all 32 per-output profile values in one report.
    ///
    /// Each value is 1..=48 (PWM duty) or 129..=132 (auto-pulse mode).
    /// No-op when the unit is not attached.
    pub fn pba(&self, unit: UnitHandle, profiles: &[u8; PBA_LEN]) {
        trace!("pba unit={unit}");
        let Some(device) = self.device_for(unit) else {
            return;
        };
        if self.core.queue.push(Some(device), ChunkKind::Pba, profiles) == 0 {
            debug!("pba dropped: {}", Error::QueueShutDown);
        }
    }

    /// Queue up to 32 bytes verbatim. Returns the number of bytes accepted
    /// (0 for an empty payload, a missing unit, or a shut-down queue).
    pub fn raw_write(&self, unit: UnitHandle, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let n = data.len().min(MAX_WRITE);
        let Some(device) = self.device_for(unit) else {
            return 0;
        };
        let accepted = self.core.queue.push(Some(device), ChunkKind::Raw, &data[..n]);
        if accepted == 0 {
            debug!("raw_write dropped: {}", Error::QueueShutDown);
        }
        accepted
    }

    /// Drain the queue, then read up to 64 bytes from the device.
    /// Returns 0 on timeout, error, or a missing unit.
    ///
    /// The drain means the read observes the device after every previously
    /// queued write from this thread has been issued.
    pub fn raw_read(&self, unit: UnitHandle, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let Some(device) = self.device_for(unit) else {
            return 0;
        };
        let n = buf.len().min(MAX_READ);
        self.core.queue.wait_empty();
        device.read(&mut buf[..n])
    }

    /// Install the simple notification callback and client device list,
    /// then rescan.
    ///
    /// The slot table is dropped first, so the rescan reports every
    /// currently attached device as newly added; clients that install a
    /// callback always get a full set of Add notifications.
    pub fn set_notify(&self, callback: Option<NotifyCallback>, list: Option<SharedDeviceList>) {
        let guard = self.core.cs.lock();
        {
            let mut st = guard.borrow_mut();
            st.registry.free_all();
            st.registry.install_simple(callback, list);
        }
        self.core.rescan_attached();
    }

    /// Install the extended notification callback and client device list,
    /// then rescan.
    ///
    /// Unlike [`set_notify`](Self::set_notify) the slot table is kept, so
    /// only genuinely new devices produce Add notifications.
    pub fn set_notify_ex(&self, callback: Option<NotifyCallback>, list: Option<SharedDeviceList>) {
        let guard = self.core.cs.lock();
        {
            let mut st = guard.borrow_mut();
            st.registry.install_extended(callback, list);
        }
        self.core.rescan_attached();
    }

    /// Register for hot-plug notifications through a host event sink, or
    /// unregister with `None`.
    ///
    /// Registration is refused (silently, like every failure here) when a
    /// sink is already installed, when no notification callback has been
    /// set, or when `unit`'s slot is empty.
    pub fn register(&self, unit: UnitHandle, sink: Option<Arc<dyn EventSink>>) {
        let guard = self.core.cs.lock();

        let Some(sink) = sink else {
            let reg = guard.borrow_mut().hotplug.take();
            if let Some(reg) = reg {
                reg.sink.restore(reg.handler.take_prior());
            }
            return;
        };

        {
            let st = guard.borrow();
            if st.hotplug.is_some() {
                // One sink per context; re-registering is a no-op.
                return;
            }
            if !st.registry.has_callback() {
                return;
            }
            let Some(slot) = protocol::slot_for_unit(unit) else {
                return;
            };
            if st.registry.device_for_slot(slot).is_none() {
                return;
            }
        }

        let handler = Arc::new(ShimHandler {
            core: Arc::downgrade(&self.core),
            prior: Mutex::new(None),
        });
        let installed: Arc<dyn EventHandler> = handler.clone();
        let prior = sink.install(installed);
        *handler.prior.lock() = prior;
        guard.borrow_mut().hotplug = Some(HotplugRegistration { sink, handler });
        debug!("hot-plug sink registered");
    }

    /// Tear the context down: free devices, unhook the sink, stop the
    /// writer thread and join it.
    pub fn close(self) {
        self.core.shutdown(false);
    }

    /// Like [`close`](Self::close), but never joins the writer thread.
    ///
    /// For hosts tearing the library down from an unload callback where
    /// joining a thread of the current process would deadlock; shutdown is
    /// observed through the writer's exit signal instead.
    pub fn close_for_unload(self) {
        self.core.shutdown(true);
    }

    fn device_for(&self, unit: UnitHandle) -> Option<Arc<UsbDevice>> {
        let device = protocol::slot_for_unit(unit).and_then(|slot| {
            let guard = self.core.cs.lock();
            let device = guard.borrow().registry.device_for_slot(slot);
            device
        });
        if device.is_none() {
            debug!("{}", Error::NoSuchDevice(unit));
        }
        device
    }
}

impl Core {
    /// Rescan for arrivals and notify. Add callbacks fire only after the
    /// client list holds the complete batch.
    fn rescan_attached(&self) {
        let guard = self.cs.lock();
        let (units, cbs) = {
            let mut st = guard.borrow_mut();
            let new_slots = st.registry.scan_attached(self.host.as_ref());
            let units = st.registry.add_batch(&new_slots);
            (units, st.registry.callbacks())
        };
        for unit in units {
            notify(&cbs, NotifyReason::Add, unit);
        }
    }

    /// Probe occupied slots and notify a Delete per lost device
    fn rescan_detached(&self) {
        let guard = self.cs.lock();
        let dead = guard.borrow().registry.probe_detached(self.host.as_ref());
        for slot in dead {
            let cbs = {
                let mut st = guard.borrow_mut();
                if !st.registry.release_slot(slot) {
                    continue;
                }
                st.registry.remove_from_list(slot);
                st.registry.callbacks()
            };
            notify(&cbs, NotifyReason::Delete, protocol::unit_for_slot(slot));
        }
    }

    /// The sink is going away: free everything and unhook
    fn sink_destroyed(&self) {
        let guard = self.cs.lock();
        let reg = {
            let mut st = guard.borrow_mut();
            st.registry.free_all();
            st.hotplug.take()
        };
        if let Some(reg) = reg {
            reg.sink.restore(reg.handler.take_prior());
        }
    }

    fn shutdown(&self, unloading: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("context shutting down (unloading={unloading})");

        let reg = {
            let guard = self.cs.lock();
            let mut st = guard.borrow_mut();
            st.registry.free_all();
            st.hotplug.take()
        };
        if let Some(reg) = reg {
            reg.sink.restore(reg.handler.take_prior());
        }

        self.queue.close(unloading);
        instances::release();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

/// The handler the shim installs on the host sink. Forwards every event to
/// the handler it displaced, mirroring a subclassed message procedure.
struct ShimHandler {
    core: Weak<Core>,
    prior: Mutex<Option<Arc<dyn EventHandler>>>,
}

impl ShimHandler {
    fn take_prior(&self) -> Option<Arc<dyn EventHandler>> {
        self.prior.lock().take()
    }
}

impl EventHandler for ShimHandler {
    fn on_event(&self, event: HotplugEvent) {
        // Capture the chain target first: handling SinkDestroyed clears it.
        let prior = self.prior.lock().clone();

        if let Some(core) = self.core.upgrade() {
            match event {
                HotplugEvent::DeviceArrival => core.rescan_attached(),
                HotplugEvent::DeviceRemoval => core.rescan_detached(),
                HotplugEvent::SinkDestroyed => core.sink_destroyed(),
            }
        }

        if let Some(prior) = prior {
            prior.on_event(event);
        }
    }
}

fn notify(
    cbs: &(Option<NotifyCallback>, Option<NotifyCallback>),
    reason: NotifyReason,
    unit: UnitHandle,
) {
    if let Some(cb) = &cbs.0 {
        cb(reason, unit);
    }
    if let Some(cb) = &cbs.1 {
        cb(reason, unit);
    }
}

/// Advisory accounting of open contexts in this process, standing in for
/// the named cross-instance mutex of the Windows DLL. Never gates I/O.
mod instances {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing::debug;

    use crate::protocol::PROCESS_SYNC_NAME;

    static OPEN: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn acquire() {
        let prev = OPEN.fetch_add(1, Ordering::SeqCst);
        if prev > 0 {
            debug!("{PROCESS_SYNC_NAME}: {prev} other open context(s) in this process");
        }
    }

    pub(crate) fn release() {
        OPEN.fetch_sub(1, Ordering::SeqCst);
    }
}
