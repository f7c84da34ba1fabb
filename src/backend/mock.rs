//! Deterministic in-process USB bus for tests.
//!
//! [`MockBackend`] and [`MockDevice`] are cheap clone-handles around shared
//! state, so a test keeps one clone for scripting while the engine drives
//! the other through the backend traits. Control transfers are recorded,
//! bulk submissions are parked until the test completes them, and
//! cancellation produces the same asynchronous `Cancelled` completions a
//! real host stack delivers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    Completion, DeviceDesc, TransferStatus, TransferToken, UsbBackend, UsbDevice,
};
use crate::error::{Error, Result};

/// Failure a scripted operation should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Interface already claimed elsewhere.
    Busy,
    /// Permission denied.
    NoAccess,
    /// Device disappeared.
    NoDevice,
    /// Interface does not exist.
    NoInterface,
}

impl MockFailure {
    fn to_error(self) -> Error {
        match self {
            MockFailure::Busy => Error::InterfaceBusy,
            MockFailure::NoAccess => Error::NoAccess,
            MockFailure::NoDevice => Error::NoDevice,
            MockFailure::NoInterface => Error::NoInterface,
        }
    }
}

/// One recorded control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

type CompletionQueue = Arc<Mutex<VecDeque<Completion>>>;

/// Scriptable USB backend.
#[derive(Clone)]
pub struct MockBackend {
    devices: Arc<Mutex<Vec<MockDevice>>>,
    completions: CompletionQueue,
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            devices: Arc::new(Mutex::new(Vec::new())),
            completions: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Add a device to the bus and return its scripting handle.
    pub fn add_device(&self, desc: DeviceDesc) -> MockDevice {
        let device = MockDevice {
            inner: Arc::new(Mutex::new(DevInner {
                desc,
                claimed: None,
                claim_count: 0,
                release_count: 0,
                claim_failure: None,
                fail_controls: false,
                controls: Vec::new(),
                control_responses: VecDeque::new(),
                pending_in: VecDeque::new(),
                pending_out: VecDeque::new(),
                in_backlog: VecDeque::new(),
                loopback: None,
                auto_out: false,
                out_partial: None,
                cancelled: Vec::new(),
            })),
            completions: self.completions.clone(),
        };
        self.devices.lock().push(device.clone());
        device
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbBackend for MockBackend {
    fn devices(&self) -> Result<Vec<DeviceDesc>> {
        Ok(self.devices.lock().iter().map(|d| d.descriptor()).collect())
    }

    fn open(&self, desc: &DeviceDesc) -> Result<Arc<dyn UsbDevice>> {
        let devices = self.devices.lock();
        let device = devices
            .iter()
            .find(|d| {
                let dd = d.descriptor();
                dd.bus == desc.bus && dd.addr == desc.addr
            })
            .ok_or(Error::NoDevice)?;
        Ok(Arc::new(device.clone()))
    }

    fn handle_events(&self, _timeout: Duration) -> Result<Vec<Completion>> {
        Ok(self.completions.lock().drain(..).collect())
    }
}

struct DevInner {
    desc: DeviceDesc,
    claimed: Option<u8>,
    claim_count: u32,
    release_count: u32,
    claim_failure: Option<MockFailure>,
    fail_controls: bool,
    controls: Vec<ControlRecord>,
    control_responses: VecDeque<Vec<u8>>,
    pending_in: VecDeque<(u8, TransferToken, usize)>,
    pending_out: VecDeque<(u8, TransferToken, Vec<u8>)>,
    in_backlog: VecDeque<u8>,
    /// `Some(prefix)` echoes completed OUT data back as IN completions,
    /// each prefixed with `prefix` (the FTDI status-byte shape).
    loopback: Option<Vec<u8>>,
    auto_out: bool,
    out_partial: Option<usize>,
    cancelled: Vec<u8>,
}

impl DevInner {
    /// Deliver backlog bytes into parked IN transfers, one completion per
    /// transfer, honoring the transfer capacity and the loopback prefix.
    fn pump(&mut self, completions: &CompletionQueue) {
        let prefix = self.loopback.clone().unwrap_or_default();
        while !self.in_backlog.is_empty() {
            let Some((_, token, cap)) = self.pending_in.pop_front() else {
                return;
            };
            let room = cap.saturating_sub(prefix.len());
            let take = room.min(self.in_backlog.len());
            let mut buffer = prefix.clone();
            buffer.extend(self.in_backlog.drain(..take));
            let actual_len = buffer.len();
            completions.lock().push_back(Completion {
                token,
                status: TransferStatus::Completed,
                buffer,
                actual_len,
            });
        }
    }
}

/// Scripting handle for one mock device.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Mutex<DevInner>>,
    completions: CompletionQueue,
}

impl MockDevice {
    /// Make the next `claim_interface` fail.
    pub fn set_claim_failure(&self, failure: Option<MockFailure>) {
        self.inner.lock().claim_failure = failure;
    }

    /// Fail every control transfer from now on.
    pub fn fail_controls(&self, fail: bool) {
        self.inner.lock().fail_controls = fail;
    }

    /// Queue a scripted response for the next IN control transfer.
    pub fn push_control_response(&self, data: Vec<u8>) {
        self.inner.lock().control_responses.push_back(data);
    }

    /// All control transfers seen so far.
    pub fn controls(&self) -> Vec<ControlRecord> {
        self.inner.lock().controls.clone()
    }

    pub fn claim_count(&self) -> u32 {
        self.inner.lock().claim_count
    }

    pub fn release_count(&self) -> u32 {
        self.inner.lock().release_count
    }

    pub fn is_claimed(&self) -> bool {
        self.inner.lock().claimed.is_some()
    }

    /// Endpoints that have been cancelled so far.
    pub fn cancelled_endpoints(&self) -> Vec<u8> {
        self.inner.lock().cancelled.clone()
    }

    /// Number of IN transfers currently parked.
    pub fn pending_in_count(&self) -> usize {
        self.inner.lock().pending_in.len()
    }

    /// Data of the oldest parked OUT transfer, if any.
    pub fn pending_out_data(&self) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .pending_out
            .front()
            .map(|(_, _, d)| d.clone())
    }

    /// Complete the oldest OUT transfer, reporting `actual` bytes sent.
    pub fn complete_out(&self, actual: usize) -> bool {
        let mut inner = self.inner.lock();
        let Some((_, token, data)) = inner.pending_out.pop_front() else {
            return false;
        };
        let actual_len = actual.min(data.len());
        self.completions.lock().push_back(Completion {
            token,
            status: TransferStatus::Completed,
            buffer: data,
            actual_len,
        });
        true
    }

    /// Complete the oldest OUT transfer in full.
    pub fn complete_out_full(&self) -> bool {
        let len = match self.inner.lock().pending_out.front() {
            Some((_, _, d)) => d.len(),
            None => return false,
        };
        self.complete_out(len)
    }

    /// Deliver `data` through the oldest parked IN transfers (split across
    /// transfers if it exceeds one transfer's capacity).
    pub fn inject_in(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.in_backlog.extend(data.iter().copied());
        inner.pump(&self.completions);
    }

    /// Expire the oldest parked IN transfer with a benign timeout.
    pub fn timeout_in(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some((_, token, _)) = inner.pending_in.pop_front() else {
            return false;
        };
        self.completions.lock().push_back(Completion {
            token,
            status: TransferStatus::TimedOut,
            buffer: Vec::new(),
            actual_len: 0,
        });
        true
    }

    /// Fail the oldest parked IN transfer with the given terminal status.
    pub fn fail_in(&self, status: TransferStatus) -> bool {
        let mut inner = self.inner.lock();
        let Some((_, token, _)) = inner.pending_in.pop_front() else {
            return false;
        };
        self.completions.lock().push_back(Completion {
            token,
            status,
            buffer: Vec::new(),
            actual_len: 0,
        });
        true
    }

    /// Complete every OUT transfer in full as soon as it is submitted.
    pub fn set_auto_out(&self, auto: bool) {
        self.inner.lock().auto_out = auto;
    }

    /// Make the next OUT completion report only `actual` bytes sent.
    pub fn set_out_partial(&self, actual: usize) {
        self.inner.lock().out_partial = Some(actual);
    }

    /// Echo OUT data back as IN completions, each carrying `prefix` first.
    pub fn set_loopback(&self, prefix: Vec<u8>) {
        let mut inner = self.inner.lock();
        inner.loopback = Some(prefix);
        inner.auto_out = true;
    }
}

impl UsbDevice for MockDevice {
    fn descriptor(&self) -> DeviceDesc {
        self.inner.lock().desc
    }

    fn claim_interface(&self, number: u8) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(failure) = inner.claim_failure {
            return Err(failure.to_error());
        }
        inner.claimed = Some(number);
        inner.claim_count += 1;
        Ok(())
    }

    fn release_interface(&self, _number: u8) {
        let mut inner = self.inner.lock();
        inner.claimed = None;
        inner.release_count += 1;
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.controls.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        if inner.fail_controls {
            return Err(Error::Control("scripted failure".into()));
        }
        Ok(data.len())
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.controls.push(ControlRecord {
            request_type,
            request,
            value,
            index,
            data: Vec::new(),
        });
        if inner.fail_controls {
            return Err(Error::Control("scripted failure".into()));
        }
        let response = inner.control_responses.pop_front().unwrap_or_default();
        let n = response.len().min(buf.len());
        buf[..n].copy_from_slice(&response[..n]);
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(buf.len())
    }

    fn submit_bulk_in(
        &self,
        endpoint: u8,
        token: TransferToken,
        len: usize,
        _timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pending_in.push_back((endpoint, token, len));
        inner.pump(&self.completions);
        Ok(())
    }

    fn submit_bulk_out(
        &self,
        endpoint: u8,
        token: TransferToken,
        data: Vec<u8>,
        _timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pending_out.push_back((endpoint, token, data));
        if let Some(actual) = inner.out_partial.take() {
            let (_, token, data) = inner.pending_out.pop_back().expect("just pushed");
            let actual_len = actual.min(data.len());
            self.completions.lock().push_back(Completion {
                token,
                status: TransferStatus::Completed,
                buffer: data,
                actual_len,
            });
        } else if inner.auto_out {
            let (_, token, data) = inner.pending_out.pop_back().expect("just pushed");
            let actual_len = data.len();
            if inner.loopback.is_some() {
                inner.in_backlog.extend(data.iter().copied());
            }
            self.completions.lock().push_back(Completion {
                token,
                status: TransferStatus::Completed,
                buffer: data,
                actual_len,
            });
            inner.pump(&self.completions);
        }
        Ok(())
    }

    fn cancel_endpoint(&self, endpoint: u8) {
        let mut inner = self.inner.lock();
        inner.cancelled.push(endpoint);
        let mut completions = self.completions.lock();
        let mut keep_in = VecDeque::new();
        while let Some((ep, token, len)) = inner.pending_in.pop_front() {
            if ep == endpoint {
                completions.push_back(Completion {
                    token,
                    status: TransferStatus::Cancelled,
                    buffer: Vec::new(),
                    actual_len: 0,
                });
            } else {
                keep_in.push_back((ep, token, len));
            }
        }
        inner.pending_in = keep_in;
        let mut keep_out = VecDeque::new();
        while let Some((ep, token, data)) = inner.pending_out.pop_front() {
            if ep == endpoint {
                completions.push_back(Completion {
                    token,
                    status: TransferStatus::Cancelled,
                    buffer: data,
                    actual_len: 0,
                });
            } else {
                keep_out.push_back((ep, token, data));
            }
        }
        inner.pending_out = keep_out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChannelKey, TransferRole};

    fn token(role: TransferRole) -> TransferToken {
        TransferToken {
            channel: ChannelKey { index: 0, gen: 0 },
            role,
        }
    }

    fn desc() -> DeviceDesc {
        DeviceDesc {
            vid: 0x1a86,
            pid: 0x7523,
            bus: 1,
            addr: 2,
            bcd_device: 0x0100,
            device_class: 0xff,
            max_packet_size_0: 8,
        }
    }

    #[test]
    fn inject_splits_across_transfer_capacity() {
        let bus = MockBackend::new();
        let dev = bus.add_device(desc());
        dev.submit_bulk_in(0x82, token(TransferRole::In0), 4, Duration::ZERO)
            .unwrap();
        dev.submit_bulk_in(0x82, token(TransferRole::In1), 4, Duration::ZERO)
            .unwrap();
        dev.inject_in(b"abcdef");
        let events = bus.handle_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(&events[0].buffer[..events[0].actual_len], b"abcd");
        assert_eq!(&events[1].buffer[..events[1].actual_len], b"ef");
    }

    #[test]
    fn loopback_prefixes_every_completion() {
        let bus = MockBackend::new();
        let dev = bus.add_device(desc());
        dev.set_loopback(vec![0x01, 0x60]);
        dev.submit_bulk_in(0x81, token(TransferRole::In0), 8, Duration::ZERO)
            .unwrap();
        dev.submit_bulk_out(0x02, token(TransferRole::Out), b"hello".to_vec(), Duration::ZERO)
            .unwrap();
        let events = bus.handle_events(Duration::ZERO).unwrap();
        // OUT completion plus one prefixed IN completion
        assert_eq!(events.len(), 2);
        let input = events
            .iter()
            .find(|c| c.token.role == TransferRole::In0)
            .unwrap();
        assert_eq!(&input.buffer[..input.actual_len], b"\x01\x60hello");
    }

    #[test]
    fn cancel_reports_each_pending_transfer_once() {
        let bus = MockBackend::new();
        let dev = bus.add_device(desc());
        dev.submit_bulk_in(0x82, token(TransferRole::In0), 64, Duration::ZERO)
            .unwrap();
        dev.submit_bulk_in(0x82, token(TransferRole::In1), 64, Duration::ZERO)
            .unwrap();
        dev.cancel_endpoint(0x82);
        let events = bus.handle_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|c| c.status == TransferStatus::Cancelled));
        assert!(bus.handle_events(Duration::ZERO).unwrap().is_empty());
    }
}
