//! Host-OS seam: HID enumeration and raw endpoint I/O
//!
//! The core never talks to the OS directly. Everything it needs from the
//! platform is behind [`HidHost`] and [`HidEndpoint`], with [`HidapiHost`]
//! as the production implementation. Test suites substitute in-memory
//! hosts behind the same traits.

use std::ffi::CString;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Error;

/// One enumerated HID endpoint, before any filtering
#[derive(Debug, Clone)]
pub struct HidDeviceInfo {
    /// Platform path usable with [`HidHost::open`]
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Capabilities of an opened endpoint, as the registry filter sees them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidCapabilities {
    /// Number of top-level collections in the report descriptor
    pub collection_count: u16,
    /// Output report length in bytes, report-id byte included
    pub output_report_len: u16,
}

/// HID-class device lookup and open
pub trait HidHost: Send + Sync {
    /// List every HID endpoint currently present
    fn enumerate(&self) -> Result<Vec<HidDeviceInfo>, Error>;

    /// Open an endpoint for shared read/write access
    fn open(&self, path: &str) -> Result<Box<dyn HidEndpoint>, Error>;

    /// Liveness probe: can the path still be opened read/write?
    ///
    /// Used by the registry's detach scan; the transient handle is closed
    /// immediately.
    fn probe(&self, path: &str) -> bool;
}

/// An opened HID endpoint
pub trait HidEndpoint: Send {
    /// Blocking write of one outgoing payload. The implementation adds
    /// whatever framing the OS requires (leading zero report-id byte,
    /// splitting into device-sized reports).
    fn write(&mut self, payload: &[u8]) -> Result<usize, Error>;

    /// Blocking read with timeout; `Ok(0)` on timeout
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Capability snapshot taken at open time
    fn capabilities(&self) -> HidCapabilities;

    /// Product string reported by the device, if any
    fn product_string(&self) -> Option<String>;
}

// ============================================================================
// hidapi implementation
// ============================================================================

/// Production host backed by the hidapi library
pub struct HidapiHost {
    api: Mutex<HidApi>,
}

impl HidapiHost {
    pub fn new() -> Result<Self, Error> {
        let api = HidApi::new()?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl HidHost for HidapiHost {
    fn enumerate(&self) -> Result<Vec<HidDeviceInfo>, Error> {
        let mut api = self.api.lock();
        api.refresh_devices()?;

        let mut out = Vec::new();
        for info in api.device_list() {
            out.push(HidDeviceInfo {
                path: info.path().to_string_lossy().into_owned(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
            });
        }
        debug!("enumerated {} HID endpoints", out.len());
        Ok(out)
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidEndpoint>, Error> {
        let cpath =
            CString::new(path).map_err(|_| Error::Unavailable(path.to_string()))?;
        let api = self.api.lock();
        let device = api
            .open_path(&cpath)
            .map_err(|_| Error::Unavailable(path.to_string()))?;

        let caps = read_capabilities(&device);
        let product = device.get_product_string().ok().flatten();

        Ok(Box::new(HidapiEndpoint {
            device,
            caps,
            product,
        }))
    }

    fn probe(&self, path: &str) -> bool {
        let Ok(cpath) = CString::new(path) else {
            return false;
        };
        self.api.lock().open_path(&cpath).is_ok()
    }
}

struct HidapiEndpoint {
    device: HidDevice,
    caps: HidCapabilities,
    product: Option<String>,
}

impl HidEndpoint for HidapiEndpoint {
    fn write(&mut self, payload: &[u8]) -> Result<usize, Error> {
        // One logical payload can span several wire reports: a 32-byte
        // profile block goes out as four consecutive 8-byte reports.
        let frame = self.caps.output_report_len.max(2) as usize - 1;
        let mut report = vec![0u8; frame + 1];

        for part in payload.chunks(frame) {
            report[0] = 0; // report id
            report[1..1 + part.len()].copy_from_slice(part);
            report[1 + part.len()..].fill(0);
            self.device
                .write(&report)
                .map_err(|e| Error::DeviceIo(e.to_string()))?;
        }
        Ok(payload.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.device
            .read_timeout(buf, timeout.as_millis() as i32)
            .map_err(|e| Error::DeviceIo(e.to_string()))
    }

    fn capabilities(&self) -> HidCapabilities {
        self.caps
    }

    fn product_string(&self) -> Option<String> {
        self.product.clone()
    }
}

/// Derive the capability snapshot from the raw report descriptor.
///
/// hidapi exposes the descriptor bytes but not parsed capabilities, so a
/// minimal item scan is done here: top-level collection count, and the
/// widest output report (bits accumulated per report id, plus the
/// report-id byte that platform HID stacks count toward the length).
fn read_capabilities(device: &HidDevice) -> HidCapabilities {
    let mut buf = [0u8; 4096];
    match device.get_report_descriptor(&mut buf) {
        Ok(n) => parse_capabilities(&buf[..n]),
        Err(e) => {
            warn!("report descriptor unavailable: {e}");
            HidCapabilities {
                collection_count: 0,
                output_report_len: 0,
            }
        }
    }
}

fn parse_capabilities(desc: &[u8]) -> HidCapabilities {
    const TYPE_MAIN: u8 = 0;
    const TYPE_GLOBAL: u8 = 1;
    const MAIN_OUTPUT: u8 = 0x9;
    const MAIN_COLLECTION: u8 = 0xA;
    const MAIN_END_COLLECTION: u8 = 0xC;
    const GLOBAL_REPORT_SIZE: u8 = 0x7;
    const GLOBAL_REPORT_ID: u8 = 0x8;
    const GLOBAL_REPORT_COUNT: u8 = 0x9;

    let mut pos = 0usize;
    let mut depth = 0u32;
    let mut top_level = 0u16;
    let mut report_size = 0u32;
    let mut report_count = 0u32;
    let mut output_bits = 0u32;
    let mut output_bits_max = 0u32;

    while pos < desc.len() {
        let prefix = desc[pos];
        pos += 1;

        if prefix == 0xFE {
            // long item: size byte + tag byte + data
            if pos + 1 >= desc.len() {
                break;
            }
            pos += 2 + desc[pos] as usize;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            s => s as usize,
        };
        if pos + size > desc.len() {
            break;
        }
        let mut value = 0u32;
        for (i, b) in desc[pos..pos + size].iter().enumerate() {
            value |= (*b as u32) << (8 * i);
        }
        pos += size;

        let item_type = (prefix >> 2) & 0x03;
        let tag = prefix >> 4;

        match (item_type, tag) {
            (TYPE_MAIN, MAIN_COLLECTION) => {
                if depth == 0 {
                    top_level += 1;
                }
                depth += 1;
            }
            (TYPE_MAIN, MAIN_END_COLLECTION) => {
                depth = depth.saturating_sub(1);
            }
            (TYPE_MAIN, MAIN_OUTPUT) => {
                output_bits += report_size * report_count;
            }
            (TYPE_GLOBAL, GLOBAL_REPORT_SIZE) => report_size = value,
            (TYPE_GLOBAL, GLOBAL_REPORT_COUNT) => report_count = value,
            (TYPE_GLOBAL, GLOBAL_REPORT_ID) => {
                output_bits_max = output_bits_max.max(output_bits);
                output_bits = 0;
            }
            _ => {}
        }
    }
    output_bits_max = output_bits_max.max(output_bits);

    HidCapabilities {
        collection_count: top_level,
        output_report_len: if output_bits_max == 0 {
            0
        } else {
            (1 + output_bits_max.div_ceil(8)) as u16
        },
    }
}
