//! Smoke tests against a physical controller.
//!
//! These require at least one LedWiz-family unit to be plugged in.
//! Run with: cargo test --test hardware -- --ignored --nocapture

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use ledwiz::{DeviceList, LedWiz, NotifyCallback, NotifyReason};

/// Open the platform stack and collect the attached units
fn open_and_scan() -> (LedWiz, Vec<i32>) {
    let lw = LedWiz::open_default().expect("HID stack unavailable");

    let list = DeviceList::shared();
    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let callback: NotifyCallback = {
        let seen = seen.clone();
        Arc::new(move |reason, unit| {
            if reason == NotifyReason::Add {
                seen.lock().push(unit);
            }
        })
    };
    lw.set_notify(Some(callback), Some(list.clone()));

    let units = seen.lock().clone();
    assert_eq!(
        units.len() as i32,
        list.lock().numdevices,
        "callback count and list count must agree"
    );
    (lw, units)
}

#[test]
#[ignore] // requires hardware
fn enumerates_at_least_one_unit() {
    let (lw, units) = open_and_scan();
    assert!(
        !units.is_empty(),
        "no controller found, plug in a LedWiz-family unit"
    );
    eprintln!("attached units: {units:?}");
    lw.close();
}

#[test]
#[ignore] // requires hardware
fn flashes_first_unit() {
    let (lw, units) = open_and_scan();
    let unit = *units.first().expect("no controller found");

    // Everything on at full brightness, then everything off.
    lw.pba(unit, &[48u8; 32]);
    lw.sba(unit, 0xFF, 0xFF, 0xFF, 0xFF, 2);
    thread::sleep(Duration::from_millis(500));
    lw.sba(unit, 0, 0, 0, 0, 2);

    lw.close();
}
