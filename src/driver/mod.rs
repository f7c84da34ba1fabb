//! Device-driver abstraction and driver registry.
//!
//! A [`SerialDriver`] wraps one claimed interface of an opened converter
//! chip and knows its vendor protocol: how to program line parameters and
//! baud divisors, what the bulk endpoints are, and how to interpret the
//! raw bytes of a completed IN transfer. The engine is otherwise
//! chip-agnostic.
//!
//! Drivers are produced by factories held in a [`DriverRegistry`]. A
//! factory inspects the device descriptor, probes the hardware and, if it
//! accepts the device, returns a driver with the interface claimed.

mod ch34x;
mod ftdi;
mod pl2303;

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::backend::UsbDevice;
use crate::error::{Error, Result};
use crate::types::{LineParams, Status};

/// Control-transfer timeout used by all drivers.
pub(crate) const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor request, host to device.
const VENDOR_OUT: u8 = 0x40;
/// Vendor request, device to host.
const VENDOR_IN: u8 = 0xc0;

/// Bulk endpoints and preferred transfer size for one claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    /// Bulk IN endpoint address.
    pub ep_in: u8,
    /// Bulk OUT endpoint address.
    pub ep_out: u8,
    /// Preferred bulk transfer payload size in bytes.
    pub chunk_size: usize,
}

/// A vendor-specific USB-to-UART driver bound to one claimed interface.
pub trait SerialDriver: Send {
    /// The interface's bulk endpoints and chunk size.
    fn endpoints(&self) -> BulkEndpoints;

    /// Program the full line configuration, then reset the part.
    fn setup(&mut self, line: &LineParams) -> Result<()>;

    /// Change only the baud rate.
    fn set_baudrate(&mut self, baudrate: u32) -> Result<()>;

    /// Device-defined reset; may be a no-op.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Send an RS-232 break.
    fn send_break(&mut self) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Inspect a completed IN transfer and return the offset where user
    /// payload starts. Drivers that prepend status bytes strip them here
    /// and may accumulate line-error flags.
    fn read_done(&mut self, data: &[u8]) -> usize {
        let _ = data;
        0
    }

    /// Called after an OUT transfer is fully consumed by the device.
    fn write_done(&mut self) {}

    /// Called before outbound data is gathered, with the empty OUT buffer.
    /// Drivers that need an in-band header push it here.
    fn prepare_write(&mut self, buf: &mut Vec<u8>) {
        let _ = buf;
    }

    /// Accumulated line-error status bits.
    fn line_errors(&self) -> Status {
        Status::empty()
    }
}

/// Shared control-transfer plumbing for drivers: a claimed interface plus
/// the value/index vendor-write and vendor-read idioms the converter
/// protocols are built from. Releases the interface on drop, so a failed
/// probe rolls the claim back automatically.
pub(crate) struct ControlOps {
    dev: Arc<dyn UsbDevice>,
    ifc: u8,
}

impl ControlOps {
    /// Claim `ifc` on `dev`.
    pub(crate) fn claim(dev: Arc<dyn UsbDevice>, ifc: u8) -> Result<Self> {
        dev.claim_interface(ifc)?;
        Ok(ControlOps { dev, ifc })
    }

    pub(crate) fn interface(&self) -> u8 {
        self.ifc
    }

    /// Vendor write of a value/index pair with no data stage.
    pub(crate) fn write_cv(&self, request: u8, value: u16, index: u16) -> Result<()> {
        self.dev
            .control_out(VENDOR_OUT, request, value, index, &[], CONTROL_TIMEOUT)
            .map(|_| ())
    }

    /// Vendor read of a single byte.
    pub(crate) fn read_cv_u8(&self, request: u8, value: u16) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.dev
            .control_in(VENDOR_IN, request, value, 0, &mut buf, CONTROL_TIMEOUT)?;
        Ok(buf[0])
    }

    /// Raw control write with an explicit request type.
    pub(crate) fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<()> {
        self.dev
            .control_out(request_type, request, value, index, data, CONTROL_TIMEOUT)
            .map(|_| ())
    }

    /// Raw control read with an explicit request type.
    pub(crate) fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.dev
            .control_in(request_type, request, value, index, buf, CONTROL_TIMEOUT)
    }
}

impl Drop for ControlOps {
    fn drop(&mut self) {
        self.dev.release_interface(self.ifc);
    }
}

/// A driver factory: inspects the device and either declines (`Ok(None)`),
/// accepts with a probed, claimed driver (`Ok(Some(_))`), or fails.
///
/// A factory error means the device matched but could not be brought up
/// (probe mismatch, claim failure); it aborts the registry scan.
pub type DriverFactory = fn(&Arc<dyn UsbDevice>, u8) -> Result<Option<Box<dyn SerialDriver>>>;

/// Ordered collection of driver factories.
///
/// Factories are tried in registration order; the first that accepts the
/// device wins. [`Context::new`](crate::Context::new) installs the three
/// stock factories; embedders may add their own.
pub struct DriverRegistry {
    factories: Mutex<Vec<(&'static str, DriverFactory)>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        DriverRegistry {
            factories: Mutex::new(Vec::new()),
        }
    }

    /// A registry with the stock FTDI, CH34x and PL2303 factories.
    pub fn with_stock_drivers() -> Self {
        let registry = Self::new();
        registry.add("ftdi", ftdi::probe);
        registry.add("ch34x", ch34x::probe);
        registry.add("pl2303", pl2303::probe);
        registry
    }

    /// Append a factory.
    pub fn add(&self, name: &'static str, factory: DriverFactory) {
        self.factories.lock().push((name, factory));
    }

    /// Remove a factory by name.
    pub fn remove(&self, name: &str) {
        self.factories.lock().retain(|(n, _)| *n != name);
    }

    /// Run the factories against an opened device until one accepts it.
    pub fn create(
        &self,
        dev: &Arc<dyn UsbDevice>,
        interface: u8,
    ) -> Result<Box<dyn SerialDriver>> {
        let factories = self.factories.lock().clone();
        let desc = dev.descriptor();
        for (name, factory) in factories {
            if let Some(driver) = factory(dev, interface)? {
                debug!("{name} accepted {:04x}:{:04x}", desc.vid, desc.pid);
                return Ok(driver);
            }
        }
        Err(Error::NotSupported)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_stock_drivers()
    }
}
