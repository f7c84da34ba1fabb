//! The USB host-library contract consumed by the engine.
//!
//! The engine never talks to a USB stack directly; it drives the two traits
//! in this module. [`UsbBackend`] covers enumeration, opening and the
//! per-iteration event pass; [`UsbDevice`] covers one opened device:
//! descriptor access, interface claiming, control transfers and
//! asynchronous bulk traffic.
//!
//! Bulk transfers hand buffer ownership back and forth: submitting an OUT
//! transfer moves the data into the backend, and every [`Completion`]
//! returns the buffer to the engine. While a transfer is in flight the
//! engine simply does not hold the buffer, so the "do not touch a busy
//! transfer" rule is enforced by construction.
//!
//! Two implementations ship: [`nusb::NusbBackend`] for real hardware and
//! [`mock::MockBackend`] for tests.

pub mod mock;
pub mod nusb;

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::PollFlags;

use crate::error::Result;

/// Enumeration record and descriptor fields for one USB device.
///
/// `bcd_device`, `device_class` and `max_packet_size_0` are authoritative
/// on an opened device ([`UsbDevice::descriptor`]); an enumeration-time
/// record may carry zeros for fields the backend cannot read without
/// opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub addr: u8,
    /// `bcdDevice` from the device descriptor.
    pub bcd_device: u16,
    /// `bDeviceClass` from the device descriptor.
    pub device_class: u8,
    /// `bMaxPacketSize0` from the device descriptor.
    pub max_packet_size_0: u8,
}

/// Arena key of a live channel: slot index plus generation.
///
/// The generation is bumped whenever a slot is vacated, so a completion
/// that arrives for an already-destroyed channel can never be routed to a
/// recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

/// Which of a channel's three transfers a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferRole {
    /// First bulk IN transfer.
    In0,
    /// Second bulk IN transfer.
    In1,
    /// The bulk OUT transfer.
    Out,
}

/// User-data carried by a submitted transfer and echoed in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken {
    /// Owning channel.
    pub channel: ChannelKey,
    /// Which transfer of that channel.
    pub role: TransferRole,
}

/// Terminal state of an asynchronous bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Completed normally; `actual_len` bytes were transferred.
    Completed,
    /// The transfer timed out. Benign; the engine resubmits.
    TimedOut,
    /// The transfer was cancelled.
    Cancelled,
    /// The device is gone.
    NoDevice,
    /// The endpoint stalled.
    Stall,
    /// The device sent more data than requested.
    Overflow,
    /// Unspecified transfer error.
    Error,
}

/// A finished bulk transfer, as reported by [`UsbBackend::handle_events`].
#[derive(Debug)]
pub struct Completion {
    /// The token given at submit time.
    pub token: TransferToken,
    /// How the transfer ended.
    pub status: TransferStatus,
    /// The transfer buffer, returned to the engine. For IN transfers the
    /// first `actual_len` bytes are the received data; for OUT transfers
    /// this is the submitted data.
    pub buffer: Vec<u8>,
    /// Number of bytes actually transferred.
    pub actual_len: usize,
}

/// One opened USB device.
///
/// Control transfers take the raw `bmRequestType` byte; the backend decodes
/// type and recipient from it. All methods may be called from any thread.
pub trait UsbDevice: Send + Sync {
    /// The device descriptor fields.
    fn descriptor(&self) -> DeviceDesc;

    /// Claim an interface for exclusive use.
    fn claim_interface(&self, number: u8) -> Result<()>;

    /// Release a previously claimed interface.
    fn release_interface(&self, number: u8);

    /// Host-to-device control transfer. Returns the number of bytes sent.
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Device-to-host control transfer into `buf`. Returns the number of
    /// bytes received.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Submit an asynchronous bulk IN transfer of up to `len` bytes.
    fn submit_bulk_in(
        &self,
        endpoint: u8,
        token: TransferToken,
        len: usize,
        timeout: Duration,
    ) -> Result<()>;

    /// Submit an asynchronous bulk OUT transfer of the whole of `data`.
    fn submit_bulk_out(
        &self,
        endpoint: u8,
        token: TransferToken,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<()>;

    /// Cancel every in-flight transfer on the given endpoint. Cancellation
    /// is asynchronous: each affected transfer still produces a
    /// [`Completion`] with [`TransferStatus::Cancelled`].
    fn cancel_endpoint(&self, endpoint: u8);
}

/// A USB host stack.
pub trait UsbBackend: Send + Sync {
    /// Enumerate currently connected devices.
    fn devices(&self) -> Result<Vec<DeviceDesc>>;

    /// Open the device named by an enumeration record.
    fn open(&self, desc: &DeviceDesc) -> Result<Arc<dyn UsbDevice>>;

    /// Drive the backend for at most `timeout` and collect finished
    /// transfers. Called exactly once per event-loop iteration; returns as
    /// soon as at least one completion is available.
    fn handle_events(&self, timeout: Duration) -> Result<Vec<Completion>>;

    /// Backend descriptors the event loop must fold into its own
    /// `poll(2)` set. May be empty for backends that run their own reactor.
    fn poll_fds(&self) -> Vec<(RawFd, PollFlags)> {
        Vec::new()
    }
}
