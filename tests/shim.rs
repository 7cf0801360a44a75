//! End-to-end scenarios against an in-memory HID host
//!
//! The mock host scripts the device set, records every payload written to
//! each device, and exposes a counted write gate so tests can hold the
//! writer thread inside a device write and single-step it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use ledwiz::{
    DeviceList, Error, EventSink, HidCapabilities, HidDeviceInfo, HidEndpoint, HidHost,
    HotplugEvent, LedWiz, ManualSink, NotifyCallback, NotifyReason, SharedDeviceList,
};

// ===========================================================================
// Mock host
// ===========================================================================

const GOOD_CAPS: HidCapabilities = HidCapabilities {
    collection_count: 1,
    output_report_len: 9,
};

#[derive(Clone)]
struct DeviceSpec {
    path: String,
    vendor_id: u16,
    product_id: u16,
    product: Option<String>,
    caps: HidCapabilities,
    alive: bool,
    /// Scripted input reports, consumed front-first
    input: Vec<Vec<u8>>,
}

/// A controller with default pacing
fn standard(path: &str, product_id: u16) -> DeviceSpec {
    DeviceSpec {
        path: path.to_string(),
        vendor_id: 0xFAFA,
        product_id,
        product: None,
        caps: GOOD_CAPS,
        alive: true,
        input: Vec::new(),
    }
}

/// A pass-through unit: pacing is cleared at discovery, which keeps the
/// timing-sensitive tests fast
fn pinscape(path: &str, product_id: u16) -> DeviceSpec {
    DeviceSpec {
        product: Some("Pinscape Controller".to_string()),
        ..standard(path, product_id)
    }
}

struct World {
    devices: Vec<DeviceSpec>,
    logs: HashMap<String, Vec<Vec<u8>>>,
}

impl World {
    fn log(&self, path: &str) -> Vec<Vec<u8>> {
        self.logs.get(path).cloned().unwrap_or_default()
    }
}

struct GateInner {
    /// `None` means unlimited
    permits: Option<u64>,
    blocked: usize,
}

/// Counted permission to complete a device write
struct Gate {
    inner: Mutex<GateInner>,
    cv: Condvar,
}

impl Gate {
    fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GateInner {
                permits: None,
                blocked: 0,
            }),
            cv: Condvar::new(),
        })
    }

    fn closed() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GateInner {
                permits: Some(0),
                blocked: 0,
            }),
            cv: Condvar::new(),
        })
    }

    fn acquire(&self) {
        let mut g = self.inner.lock();
        loop {
            match g.permits {
                None => return,
                Some(n) if n > 0 => {
                    g.permits = Some(n - 1);
                    return;
                }
                _ => {
                    g.blocked += 1;
                    self.cv.wait(&mut g);
                    g.blocked -= 1;
                }
            }
        }
    }

    fn release(&self, n: u64) {
        if let Some(p) = self.inner.lock().permits.as_mut() {
            *p += n;
        }
        self.cv.notify_all();
    }

    fn open_wide(&self) {
        self.inner.lock().permits = None;
        self.cv.notify_all();
    }

    /// Wait until a writer is parked inside the gate
    fn wait_for_blocked_writer(&self) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.inner.lock().blocked == 0 {
            assert!(Instant::now() < deadline, "writer never reached the gate");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct MockHost {
    world: Arc<Mutex<World>>,
    gate: Arc<Gate>,
}

struct MockEndpoint {
    path: String,
    caps: HidCapabilities,
    product: Option<String>,
    world: Arc<Mutex<World>>,
    gate: Arc<Gate>,
}

impl HidEndpoint for MockEndpoint {
    fn write(&mut self, payload: &[u8]) -> Result<usize, Error> {
        self.gate.acquire();
        self.world
            .lock()
            .logs
            .entry(self.path.clone())
            .or_default()
            .push(payload.to_vec());
        Ok(payload.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error> {
        let mut world = self.world.lock();
        let Some(dev) = world.devices.iter_mut().find(|d| d.path == self.path) else {
            return Ok(0);
        };
        if dev.input.is_empty() {
            return Ok(0);
        }
        let report = dev.input.remove(0);
        let n = report.len().min(buf.len());
        buf[..n].copy_from_slice(&report[..n]);
        Ok(n)
    }

    fn capabilities(&self) -> HidCapabilities {
        self.caps
    }

    fn product_string(&self) -> Option<String> {
        self.product.clone()
    }
}

impl HidHost for MockHost {
    fn enumerate(&self) -> Result<Vec<HidDeviceInfo>, Error> {
        Ok(self
            .world
            .lock()
            .devices
            .iter()
            .map(|d| HidDeviceInfo {
                path: d.path.clone(),
                vendor_id: d.vendor_id,
                product_id: d.product_id,
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidEndpoint>, Error> {
        let world = self.world.lock();
        let dev = world
            .devices
            .iter()
            .find(|d| d.path == path && d.alive)
            .ok_or_else(|| Error::Unavailable(path.to_string()))?;
        Ok(Box::new(MockEndpoint {
            path: dev.path.clone(),
            caps: dev.caps,
            product: dev.product.clone(),
            world: self.world.clone(),
            gate: self.gate.clone(),
        }))
    }

    fn probe(&self, path: &str) -> bool {
        self.world
            .lock()
            .devices
            .iter()
            .any(|d| d.path == path && d.alive)
    }
}

fn host_with(
    devices: Vec<DeviceSpec>,
    gate: Arc<Gate>,
) -> (Arc<MockHost>, Arc<Mutex<World>>) {
    let world = Arc::new(Mutex::new(World {
        devices,
        logs: HashMap::new(),
    }));
    let host = Arc::new(MockHost {
        world: world.clone(),
        gate,
    });
    (host, world)
}

/// (reason, unit, list count at invocation, list contents at invocation)
type Events = Arc<Mutex<Vec<(NotifyReason, i32, i32, Vec<i32>)>>>;

fn recorder(events: Events, list: SharedDeviceList) -> NotifyCallback {
    Arc::new(move |reason, unit| {
        let l = list.lock();
        events
            .lock()
            .push((reason, unit, l.numdevices, l.handles().to_vec()));
    })
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[test]
fn sba_reaches_device_as_single_report() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);

    lw.set_notify(None, None);
    lw.sba(1, 0x01, 0x02, 0x03, 0x04, 3);
    lw.close();

    assert_eq!(
        world.lock().log("mock/0"),
        vec![vec![0x40, 0x01, 0x02, 0x03, 0x04, 0x03, 0x00, 0x00]]
    );
}

#[test]
fn profile_updates_coalesce_while_writer_is_busy() {
    let gate = Gate::closed();
    let (host, world) = host_with(vec![pinscape("mock/0", 0x00F0)], gate.clone());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);

    // Plug the writer inside a raw write so the profile updates stack up.
    assert_eq!(lw.raw_write(1, &[0xFF]), 1);

    let mut p1 = [0u8; 32];
    p1[0] = 10;
    let mut p2 = [0u8; 32];
    p2[0] = 20;
    lw.pba(1, &p1);
    lw.pba(1, &p2);

    gate.open_wide();
    lw.close();

    let log = world.lock().log("mock/0");
    assert_eq!(log.len(), 2, "second PBA must supersede the first");
    assert_eq!(log[0], vec![0xFF]);
    assert_eq!(log[1], p2.to_vec());
}

#[test]
fn switch_update_after_profile_keeps_queue_order() {
    let gate = Gate::closed();
    let (host, world) = host_with(vec![pinscape("mock/0", 0x00F0)], gate.clone());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);

    assert_eq!(lw.raw_write(1, &[0xEE]), 1);

    let mut p = [0u8; 32];
    p[7] = 48;
    lw.sba(1, 0x01, 0, 0, 0, 2);
    lw.pba(1, &p);
    lw.sba(1, 0x02, 0, 0, 0, 2);

    gate.open_wide();
    lw.close();

    let log = world.lock().log("mock/0");
    assert_eq!(log.len(), 4);
    assert_eq!(log[1], vec![0x40, 0x01, 0, 0, 0, 2, 0, 0]);
    assert_eq!(log[2], p.to_vec());
    assert_eq!(log[3], vec![0x40, 0x02, 0, 0, 0, 2, 0, 0]);
}

#[test]
fn producer_blocks_when_queue_fills() {
    let gate = Gate::closed();
    let (host, world) = host_with(vec![pinscape("mock/0", 0x00F0)], gate.clone());
    let lw = Arc::new(LedWiz::open(host));
    lw.set_notify(None, None);

    // Park the writer inside a write, then fill all 64 slots.
    assert_eq!(lw.raw_write(1, &[0xAA]), 1);
    gate.wait_for_blocked_writer();
    for i in 0..64u8 {
        assert_eq!(lw.raw_write(1, &[i]), 1);
    }

    let done = Arc::new(AtomicBool::new(false));
    let blocked = {
        let lw = lw.clone();
        let done = done.clone();
        thread::spawn(move || {
            lw.raw_write(1, &[0xBB]);
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(
        !done.load(Ordering::SeqCst),
        "the 65th write must block on the full queue"
    );

    // One completed device write frees exactly one slot.
    gate.release(1);
    blocked.join().unwrap();
    assert!(done.load(Ordering::SeqCst));

    gate.open_wide();
    Arc::try_unwrap(lw).ok().unwrap().close();
    assert_eq!(world.lock().log("mock/0").len(), 66);
}

#[test]
fn device_list_completes_before_first_add_callback() {
    let (host, _world) = host_with(
        vec![standard("mock/0", 0x00F0), standard("mock/1", 0x00F1)],
        Gate::unlimited(),
    );
    let lw = LedWiz::open(host);

    let list = DeviceList::shared();
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    lw.set_notify(Some(recorder(events.clone(), list.clone())), Some(list.clone()));

    let events = events.lock();
    assert_eq!(events.len(), 2);
    for (reason, _, _, _) in events.iter() {
        assert_eq!(*reason, NotifyReason::Add);
    }
    // The list already held the full batch when the first callback ran.
    let (_, _, count_at_first, handles_at_first) = &events[0];
    assert_eq!(*count_at_first, 2);
    assert_eq!(handles_at_first, &vec![1, 2]);

    let units: Vec<i32> = events.iter().map(|e| e.1).collect();
    assert_eq!(units, vec![1, 2]);
    drop(events);

    lw.close();
}

#[test]
fn failed_probe_removes_unit_and_notifies() {
    let (host, world) = host_with(vec![standard("mock/2", 0x00F2)], Gate::unlimited());
    let lw = LedWiz::open(host);

    let list = DeviceList::shared();
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    lw.set_notify(Some(recorder(events.clone(), list.clone())), Some(list.clone()));
    assert_eq!(list.lock().handles(), &[3]);

    let sink = Arc::new(ManualSink::new());
    lw.register(3, Some(sink.clone() as Arc<dyn EventSink>));
    assert!(sink.has_handler());

    world.lock().devices[0].alive = false;
    sink.dispatch(HotplugEvent::DeviceRemoval);

    let deletes: Vec<_> = events
        .lock()
        .iter()
        .filter(|e| e.0 == NotifyReason::Delete)
        .cloned()
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].1, 3);
    assert_eq!(list.lock().numdevices, 0);

    // The unit is gone: further writes are silent no-ops.
    lw.sba(3, 0xFF, 0, 0, 0, 1);
    lw.close();
    assert!(world.lock().log("mock/2").is_empty());
}

#[test]
fn arrival_event_adds_new_unit() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);

    let list = DeviceList::shared();
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    lw.set_notify(Some(recorder(events.clone(), list.clone())), Some(list.clone()));

    let sink = Arc::new(ManualSink::new());
    lw.register(1, Some(sink.clone() as Arc<dyn EventSink>));

    world.lock().devices.push(standard("mock/1", 0x00F1));
    sink.dispatch(HotplugEvent::DeviceArrival);

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].0, NotifyReason::Add);
    assert_eq!(events[1].1, 2);
    assert_eq!(list.lock().handles(), &[1, 2]);
    drop(events);

    lw.close();
}

#[test]
fn set_notify_re_emits_add_for_attached_devices() {
    let (host, _world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);

    let list = DeviceList::shared();
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let cb = recorder(events.clone(), list.clone());

    lw.set_notify(Some(cb.clone()), Some(list.clone()));
    lw.set_notify(Some(cb), Some(list.clone()));

    let events = events.lock();
    assert_eq!(events.len(), 2, "each set_notify re-announces the device");
    assert!(events.iter().all(|e| e.0 == NotifyReason::Add && e.1 == 1));
    drop(events);

    lw.close();
}

#[test]
fn set_notify_ex_keeps_slot_table_and_fires_second() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);

    let order: Arc<Mutex<Vec<(&'static str, NotifyReason, i32)>>> =
        Arc::new(Mutex::new(Vec::new()));

    let simple: NotifyCallback = {
        let order = order.clone();
        Arc::new(move |reason, unit| order.lock().push(("simple", reason, unit)))
    };
    let extended: NotifyCallback = {
        let order = order.clone();
        Arc::new(move |reason, unit| order.lock().push(("ex", reason, unit)))
    };

    lw.set_notify(Some(simple), None);
    assert_eq!(order.lock().len(), 1);

    // The extended install keeps the slot table, so the rescan finds
    // nothing new and announces nothing.
    let ex_list = DeviceList::shared();
    lw.set_notify_ex(Some(extended), Some(ex_list.clone()));
    assert_eq!(order.lock().len(), 1);
    assert_eq!(ex_list.lock().numdevices, 0);

    // A genuinely new device reaches both callbacks, simple first.
    let sink = Arc::new(ManualSink::new());
    lw.register(1, Some(sink.clone() as Arc<dyn EventSink>));
    world.lock().devices.push(standard("mock/1", 0x00F1));
    sink.dispatch(HotplugEvent::DeviceArrival);

    let order = order.lock();
    assert_eq!(
        &order[1..],
        &[
            ("simple", NotifyReason::Add, 2),
            ("ex", NotifyReason::Add, 2)
        ]
    );
    drop(order);

    lw.close();
}

#[test]
fn raw_read_drains_queue_first() {
    let mut dev = standard("mock/0", 0x00F0);
    dev.input = vec![vec![0xAB, 0xCD]];
    let (host, world) = host_with(vec![dev], Gate::unlimited());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);

    assert_eq!(lw.raw_write(1, &[0x11, 0x22]), 2);

    let mut buf = [0u8; 8];
    assert_eq!(lw.raw_read(1, &mut buf), 2);
    assert_eq!(&buf[..2], &[0xAB, 0xCD]);

    // The drain before the read guarantees the write already went out.
    assert_eq!(world.lock().log("mock/0"), vec![vec![0x11, 0x22]]);
    lw.close();
}

#[test]
fn raw_write_clamps_oversized_payload_to_32_bytes() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);

    // An unclamped 40-byte payload would read as a shutdown sentinel to
    // the queue and kill the writer; the clamp must truncate it instead.
    let big: Vec<u8> = (0u8..40).collect();
    assert_eq!(lw.raw_write(1, &big), 32);
    lw.close();

    let log = world.lock().log("mock/0");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], big[..32].to_vec());
}

#[test]
fn raw_read_clamps_to_64_bytes() {
    let mut dev = standard("mock/0", 0x00F0);
    dev.input = vec![(0u8..70).collect()];
    let (host, _world) = host_with(vec![dev], Gate::unlimited());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);

    // The device has 70 bytes pending; with an 80-byte buffer only the
    // first 64 may be asked for.
    let mut buf = [0xEEu8; 80];
    assert_eq!(lw.raw_read(1, &mut buf), 64);

    let expected: Vec<u8> = (0u8..64).collect();
    assert_eq!(&buf[..64], expected.as_slice());
    assert!(buf[64..].iter().all(|&b| b == 0xEE), "tail must be untouched");

    lw.close();
}

#[test]
fn register_refuses_without_callback_or_device() {
    let (host, _world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);

    // No callback installed yet.
    let sink = Arc::new(ManualSink::new());
    lw.register(1, Some(sink.clone() as Arc<dyn EventSink>));
    assert!(!sink.has_handler());

    lw.set_notify(Some(Arc::new(|_, _| {})), None);

    // Empty slot.
    lw.register(5, Some(sink.clone() as Arc<dyn EventSink>));
    assert!(!sink.has_handler());

    // Valid registration.
    lw.register(1, Some(sink.clone() as Arc<dyn EventSink>));
    assert!(sink.has_handler());

    // A second sink is refused while the first is installed.
    let other = Arc::new(ManualSink::new());
    lw.register(1, Some(other.clone() as Arc<dyn EventSink>));
    assert!(!other.has_handler());
    assert!(sink.has_handler());

    // Unregister restores the (empty) prior handler.
    lw.register(1, None);
    assert!(!sink.has_handler());

    lw.close();
}

#[test]
fn sink_destruction_frees_devices_and_unhooks() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);

    lw.set_notify(Some(Arc::new(|_, _| {})), None);
    let sink = Arc::new(ManualSink::new());
    lw.register(1, Some(sink.clone() as Arc<dyn EventSink>));

    sink.dispatch(HotplugEvent::SinkDestroyed);
    assert!(!sink.has_handler());

    // Slot table was freed: writes are no-ops until a rescan.
    lw.sba(1, 0xFF, 0, 0, 0, 1);
    lw.close();
    assert!(world.lock().log("mock/0").is_empty());
}

#[test]
fn callback_may_reenter_the_api() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = Arc::new(LedWiz::open(host));

    let weak = Arc::downgrade(&lw);
    let cb: NotifyCallback = Arc::new(move |reason, unit| {
        if reason == NotifyReason::Add {
            if let Some(lw) = weak.upgrade() {
                lw.sba(unit, 0x0F, 0, 0, 0, 1);
            }
        }
    });

    // The callback fires synchronously inside set_notify, on this thread,
    // and calls straight back into the API.
    lw.set_notify(Some(cb), None);

    Arc::try_unwrap(lw).ok().unwrap().close();
    assert_eq!(
        world.lock().log("mock/0"),
        vec![vec![0x40, 0x0F, 0, 0, 0, 1, 0, 0]]
    );
}

#[test]
fn close_for_unload_completes_without_joining() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);
    lw.sba(1, 0x01, 0, 0, 0, 1);

    lw.close_for_unload();
    assert_eq!(world.lock().log("mock/0").len(), 1);
}

#[test]
fn out_of_range_units_are_no_ops() {
    let (host, world) = host_with(vec![standard("mock/0", 0x00F0)], Gate::unlimited());
    let lw = LedWiz::open(host);
    lw.set_notify(None, None);

    lw.sba(0, 0xFF, 0, 0, 0, 1);
    lw.sba(17, 0xFF, 0, 0, 0, 1);
    assert_eq!(lw.raw_write(0, &[1]), 0);
    assert_eq!(lw.raw_write(2, &[1]), 0); // attached slot is unit 1 only
    let mut buf = [0u8; 4];
    assert_eq!(lw.raw_read(16, &mut buf), 0);

    lw.close();
    assert!(world.lock().log("mock/0").is_empty());
}
