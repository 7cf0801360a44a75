//! Hot-plug event sink abstraction
//!
//! On Windows this API family learned about arrivals and removals by
//! subclassing a host window procedure and chaining to the previous one.
//! That idiom is expressed here as a sink the host provides: the shim
//! installs its handler, keeps whatever handler was there before, and
//! forwards every event down the chain. udev, IOKit or a test harness all
//! fit behind the same two traits.

use std::sync::Arc;

use parking_lot::Mutex;

/// Events a host sink can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device interface appeared
    DeviceArrival,
    /// A device interface went away
    DeviceRemoval,
    /// The sink itself is being torn down
    SinkDestroyed,
}

/// Receiver of sink events. Handlers form a chain, newest first.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: HotplugEvent);
}

/// A host-provided event source supporting handler replacement with
/// chaining.
pub trait EventSink: Send + Sync {
    /// Install `handler`, returning the handler it displaced
    fn install(&self, handler: Arc<dyn EventHandler>) -> Option<Arc<dyn EventHandler>>;

    /// Put a previously displaced handler back
    fn restore(&self, prior: Option<Arc<dyn EventHandler>>);
}

/// Minimal sink for hosts that drive their own event loop: whatever
/// watches the OS (a udev monitor thread, a test harness) hands events in
/// through [`ManualSink::dispatch`].
#[derive(Default)]
pub struct ManualSink {
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
}

impl ManualSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one event to the installed handler, if any
    pub fn dispatch(&self, event: HotplugEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_event(event);
        }
    }

    /// Whether a handler is currently installed
    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }
}

impl EventSink for ManualSink {
    fn install(&self, handler: Arc<dyn EventHandler>) -> Option<Arc<dyn EventHandler>> {
        self.handler.lock().replace(handler)
    }

    fn restore(&self, prior: Option<Arc<dyn EventHandler>>) {
        *self.handler.lock() = prior;
    }
}
