//! HID device object
//!
//! [`UsbDevice`] wraps one opened endpoint and enforces the controller's
//! write pacing. Reference counting is `Arc`: the registry slot holds one
//! clone and every queued chunk holds another, so a device that is
//! unplugged mid-flight stays alive until the writer has finished with it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Error;
use crate::host::{HidCapabilities, HidEndpoint, HidHost};
use crate::protocol::{timing, MAX_WRITE};

pub struct UsbDevice {
    path: String,
    io: Mutex<Io>,
    min_write_interval: Mutex<Duration>,
}

struct Io {
    endpoint: Box<dyn HidEndpoint>,
    last_write: Option<Instant>,
}

impl UsbDevice {
    /// Open the endpoint at `path` through the host seam
    pub fn open(host: &dyn HidHost, path: &str) -> Result<Arc<Self>, Error> {
        let endpoint = host.open(path)?;
        Ok(Arc::new(Self {
            path: path.to_string(),
            io: Mutex::new(Io {
                endpoint,
                last_write: None,
            }),
            min_write_interval: Mutex::new(timing::MIN_WRITE_INTERVAL),
        }))
    }

    /// Wrap an already-opened endpoint
    pub fn from_endpoint(endpoint: Box<dyn HidEndpoint>, path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            io: Mutex::new(Io {
                endpoint,
                last_write: None,
            }),
            min_write_interval: Mutex::new(timing::MIN_WRITE_INTERVAL),
        })
    }

    /// Platform path this device was opened from
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn capabilities(&self) -> HidCapabilities {
        self.io.lock().endpoint.capabilities()
    }

    pub fn product_string(&self) -> Option<String> {
        self.io.lock().endpoint.product_string()
    }

    /// Current pacing interval
    pub fn min_write_interval(&self) -> Duration {
        *self.min_write_interval.lock()
    }

    /// Adjust pacing. Zero disables it entirely (pass-through firmware
    /// acknowledges reports at USB speed).
    pub fn set_min_write_interval(&self, interval: Duration) {
        *self.min_write_interval.lock() = interval;
    }

    /// Blocking write of up to 32 payload bytes.
    ///
    /// Honors the pacing interval relative to the last successful write,
    /// then issues the write. Returns the number of bytes written, 0 on
    /// any failure. The timestamp only advances on success.
    pub fn write(&self, payload: &[u8]) -> usize {
        if payload.is_empty() || payload.len() > MAX_WRITE {
            return 0;
        }

        let interval = *self.min_write_interval.lock();
        let mut io = self.io.lock();

        if !interval.is_zero() {
            if let Some(last) = io.last_write {
                let since = last.elapsed();
                if since < interval {
                    std::thread::sleep(interval - since);
                }
            }
        }

        match io.endpoint.write(payload) {
            Ok(n) => {
                io.last_write = Some(Instant::now());
                trace!("wrote {} bytes to {}", n, self.path);
                n
            }
            Err(e) => {
                debug!("write to {} failed: {e}", self.path);
                0
            }
        }
    }

    /// Best-effort read; 0 on timeout or error
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut io = self.io.lock();
        io.endpoint
            .read_timeout(buf, timing::READ_TIMEOUT)
            .unwrap_or(0)
    }

    /// Drain any pending input reports with zero-timeout reads.
    ///
    /// Advisory: nothing in the core path calls this, but hosts doing raw
    /// request/response exchanges use it to discard stale reports.
    pub fn clear_input(&self, report_len: usize) {
        if report_len == 0 {
            return;
        }
        let mut buf = vec![0u8; report_len];
        let mut io = self.io.lock();
        loop {
            match io.endpoint.read_timeout(&mut buf, Duration::ZERO) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }
}
