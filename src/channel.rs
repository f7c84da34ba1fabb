//! The per-device duplex state machine.
//!
//! A [`FileChannel`] binds one claimed USB interface to a pair of host
//! descriptors and pumps bytes both ways. It owns three transfer slots:
//! two bulk IN (double-buffered, strictly alternating) and one bulk OUT.
//! A slot's buffer is `Some` while the engine holds it and `None` while
//! the transfer is in flight, so the USB stack and the engine can never
//! touch the same bytes.
//!
//! Inbound: an IN completion is handed to the driver (which strips any
//! status prefix), then drained to `fd_write`; a short `write(2)` parks
//! the descriptor on the poll-list and the transfer is resubmitted only
//! once fully consumed. Outbound: `fd_read` is read straight into the OUT
//! buffer and submitted; a partial OUT completion moves the unsent tail to
//! the front and resubmits.
//!
//! Teardown is cooperative: `close` cancels in-flight transfers and the
//! channel is destroyed only after every cancellation has completed.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::PollFlags;

use crate::backend::{ChannelKey, TransferRole, TransferStatus, TransferToken, UsbDevice};
use crate::context::Reactor;
use crate::driver::{BulkEndpoints, SerialDriver};
use crate::error::{Error, Result};
use crate::types::{Channel, Status};

/// Bulk transfer timeout. Expiry is benign: the transfer is resubmitted.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    // Descriptor lifetimes are managed by the channel (or its caller);
    // raw values are only borrowed for the duration of one syscall.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Put a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(Error::Fcntl)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(Error::Fcntl)?;
    Ok(())
}

/// Cheap validity check used when descriptors enter the engine.
pub(crate) fn fd_is_valid(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

/// Create the two pipe pairs backing a pipe channel. Returns the engine's
/// I/O pair, the caller-visible pair, and all four owned ends.
pub(crate) fn make_pipe_pair() -> Result<(Channel, Channel, Vec<OwnedFd>)> {
    let (a_read, a_write) = nix::unistd::pipe().map_err(Error::Pipe)?;
    let (b_read, b_write) = nix::unistd::pipe().map_err(Error::Pipe)?;
    let io = Channel {
        fd_read: a_read.as_raw_fd(),
        fd_write: b_write.as_raw_fd(),
    };
    let visible = Channel {
        fd_read: b_read.as_raw_fd(),
        fd_write: a_write.as_raw_fd(),
    };
    Ok((io, visible, vec![a_read, a_write, b_read, b_write]))
}

/// One bulk IN transfer slot.
#[derive(Default)]
struct ReadSlot {
    /// `None` while the transfer is in flight.
    buf: Option<Vec<u8>>,
    /// Bytes received by the last completion.
    actual: usize,
    /// Drain position within `0..actual`.
    pos: usize,
}

impl ReadSlot {
    fn in_flight(&self) -> bool {
        self.buf.is_none()
    }
}

/// The bulk OUT transfer slot.
struct WriteSlot {
    /// `None` while the transfer is in flight.
    buf: Option<Vec<u8>>,
    /// Length of the submitted data.
    len: usize,
}

pub(crate) struct FileChannel {
    key: ChannelKey,
    // Driver before device: dropping the driver releases the interface
    // while the device handle is still open.
    driver: Box<dyn SerialDriver>,
    dev: Arc<dyn UsbDevice>,
    endpoints: BulkEndpoints,
    fd_read: RawFd,
    fd_write: RawFd,
    /// Caller-visible descriptor pair used for facade lookups. Equals the
    /// I/O pair for plain channels; for pipe channels it is the far ends.
    visible: Channel,
    /// Pipe channels own all four pipe ends; closed on drop.
    #[allow(dead_code)]
    owned_fds: Vec<OwnedFd>,
    read_slots: [ReadSlot; 2],
    /// Index of the IN slot currently being drained to `fd_write`.
    current: usize,
    write_slot: WriteSlot,
    pipein_ready: bool,
    pipeout_ready: bool,
    pipein_hangup: bool,
    pipeout_hangup: bool,
    device_hangup: bool,
}

impl FileChannel {
    pub(crate) fn new(
        key: ChannelKey,
        dev: Arc<dyn UsbDevice>,
        driver: Box<dyn SerialDriver>,
        io: Channel,
        visible: Channel,
        owned_fds: Vec<OwnedFd>,
    ) -> Result<Self> {
        set_nonblocking(io.fd_read)?;
        set_nonblocking(io.fd_write)?;
        let endpoints = driver.endpoints();
        Ok(FileChannel {
            key,
            driver,
            dev,
            endpoints,
            fd_read: io.fd_read,
            fd_write: io.fd_write,
            visible,
            owned_fds,
            read_slots: [ReadSlot::default(), ReadSlot::default()],
            current: 0,
            write_slot: WriteSlot { buf: None, len: 0 },
            pipein_ready: false,
            pipeout_ready: false,
            pipein_hangup: false,
            pipeout_hangup: false,
            device_hangup: false,
        })
    }

    /// Start operations: submit both IN transfers and prime the read pipe.
    pub(crate) fn init(&mut self, reactor: &Reactor) -> Result<()> {
        self.try_submit_read(0)?;
        self.try_submit_read(1)?;
        self.write_slot.buf = Some(Vec::with_capacity(self.endpoints.chunk_size));
        self.read_pipe(reactor);
        Ok(())
    }

    pub(crate) fn key(&self) -> ChannelKey {
        self.key
    }

    /// Does a facade-supplied pair name this channel?
    pub(crate) fn matches(&self, ch: Channel) -> bool {
        ch.fd_read == self.visible.fd_read || ch.fd_write == self.visible.fd_write
    }

    /// Does the engine poll this descriptor for this channel?
    pub(crate) fn owns_fd(&self, fd: RawFd) -> bool {
        fd == self.fd_read || fd == self.fd_write
    }

    pub(crate) fn io_fds(&self) -> (RawFd, RawFd) {
        (self.fd_read, self.fd_write)
    }

    pub(crate) fn status(&self) -> Status {
        let mut status = Status::empty();
        if !self.pipein_hangup {
            status |= Status::READ_PIPE_OK;
        }
        if !self.pipeout_hangup {
            status |= Status::WRITE_PIPE_OK;
        }
        if !self.device_hangup {
            status |= Status::USB_DEV_OK;
        }
        status | self.driver.line_errors()
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.driver.reset()
    }

    pub(crate) fn send_break(&mut self) -> Result<()> {
        self.driver.send_break()
    }

    /// Any transfer still in flight?
    pub(crate) fn busy(&self) -> bool {
        self.write_slot.buf.is_none() || self.read_slots.iter().any(ReadSlot::in_flight)
    }

    /// Cancel in-flight transfers and mark both pipe directions dead.
    /// Returns true when the channel is already safe to destroy.
    pub(crate) fn close(&mut self) -> bool {
        if self.write_slot.buf.is_none() {
            self.dev.cancel_endpoint(self.endpoints.ep_out);
        }
        if self.read_slots.iter().any(ReadSlot::in_flight) {
            self.dev.cancel_endpoint(self.endpoints.ep_in);
        }
        self.pipein_hangup = true;
        self.pipeout_hangup = true;
        !self.busy()
    }

    /// Record descriptor readiness reported by `poll(2)`.
    pub(crate) fn set_events(&mut self, revents: PollFlags, read_side: bool, reactor: &Reactor) {
        if revents.contains(PollFlags::POLLIN) {
            self.pipein_ready = true;
        }
        if revents.contains(PollFlags::POLLOUT) {
            self.pipeout_ready = true;
        }
        if revents.contains(PollFlags::POLLHUP) {
            if read_side {
                self.pipein_hangup = true;
            } else {
                self.pipeout_hangup = true;
            }
            self.request_removal(false, reactor);
        }
    }

    /// Dispatch pump calls for descriptors flagged ready.
    pub(crate) fn events(&mut self, reactor: &Reactor) {
        if std::mem::take(&mut self.pipein_ready) {
            self.read_pipe(reactor);
        }
        if std::mem::take(&mut self.pipeout_ready) {
            self.write_pipe(self.current, reactor);
        }
    }

    /// Pull outbound bytes from `fd_read` into the OUT buffer and submit.
    pub(crate) fn read_pipe(&mut self, reactor: &Reactor) {
        // The OUT transfer must be idle; otherwise its completion refills.
        let Some(mut buf) = self.write_slot.buf.take() else {
            return;
        };
        buf.clear();
        self.driver.prepare_write(&mut buf);
        let header = buf.len();
        buf.resize(self.endpoints.chunk_size.max(header), 0);
        let res = nix::unistd::read(self.fd_read, &mut buf[header..]);
        match res {
            Ok(0) => {
                info!("eof on read pipe");
                self.pipein_hangup = true;
                buf.truncate(header);
                self.write_slot.buf = Some(buf);
            }
            Ok(n) => {
                buf.truncate(header + n);
                self.submit_write(buf, reactor);
            }
            Err(Errno::EAGAIN) => {
                buf.truncate(header);
                self.write_slot.buf = Some(buf);
                reactor.poll_request(self.fd_read, PollFlags::POLLIN | PollFlags::POLLHUP);
            }
            Err(Errno::EINTR) => {
                info!("read interrupted, continuing");
                buf.truncate(header);
                self.write_slot.buf = Some(buf);
                reactor.poll_request(self.fd_read, PollFlags::POLLIN | PollFlags::POLLHUP);
            }
            Err(err) => {
                error!("read pipe error {err}, shutting down");
                self.pipein_hangup = true;
                buf.truncate(header);
                self.write_slot.buf = Some(buf);
                self.request_removal(false, reactor);
            }
        }
    }

    /// Drain the payload of IN slot `i` to `fd_write`.
    pub(crate) fn write_pipe(&mut self, i: usize, reactor: &Reactor) {
        let res = {
            let slot = &self.read_slots[i];
            let Some(data) = slot.buf.as_ref() else {
                warn!("accessing busy read transfer");
                return;
            };
            let payload = &data[slot.pos..slot.actual];
            if payload.is_empty() {
                return;
            }
            nix::unistd::write(borrow_fd(self.fd_write), payload)
        };
        match res {
            Ok(0) => {
                reactor.poll_request(self.fd_write, PollFlags::POLLOUT | PollFlags::POLLHUP);
            }
            Ok(n) => {
                if !self.consumed(i, n, reactor) {
                    reactor.poll_request(self.fd_write, PollFlags::POLLOUT | PollFlags::POLLHUP);
                }
            }
            Err(Errno::EAGAIN) => {
                reactor.poll_request(self.fd_write, PollFlags::POLLOUT | PollFlags::POLLHUP);
            }
            Err(Errno::EINTR) => {
                info!("write interrupted, continuing");
                reactor.poll_request(self.fd_write, PollFlags::POLLOUT | PollFlags::POLLHUP);
            }
            Err(err) => {
                error!("write pipe error {err}, shutting down");
                self.pipeout_hangup = true;
                self.request_removal(false, reactor);
            }
        }
    }

    /// Account `n` drained bytes against IN slot `i`. Once the slot is
    /// empty it is resubmitted and draining moves to the other slot.
    fn consumed(&mut self, i: usize, n: usize, reactor: &Reactor) -> bool {
        let slot = &mut self.read_slots[i];
        if slot.in_flight() {
            error!("wrong state of read transfer {i}");
            return false;
        }
        slot.pos += n;
        if slot.pos >= slot.actual {
            self.resubmit_read(i, reactor);
            self.current = 1 - i;
            true
        } else {
            false
        }
    }

    fn token(&self, role: TransferRole) -> TransferToken {
        TransferToken {
            channel: self.key,
            role,
        }
    }

    fn try_submit_read(&mut self, i: usize) -> Result<()> {
        let role = if i == 0 {
            TransferRole::In0
        } else {
            TransferRole::In1
        };
        self.dev.submit_bulk_in(
            self.endpoints.ep_in,
            self.token(role),
            self.endpoints.chunk_size,
            TRANSFER_TIMEOUT,
        )?;
        self.read_slots[i] = ReadSlot {
            buf: None,
            actual: 0,
            pos: 0,
        };
        Ok(())
    }

    fn resubmit_read(&mut self, i: usize, reactor: &Reactor) {
        if let Err(err) = self.try_submit_read(i) {
            self.submit_failed(err, reactor);
        }
    }

    fn submit_write(&mut self, data: Vec<u8>, reactor: &Reactor) {
        self.write_slot.len = data.len();
        if let Err(err) = self.dev.submit_bulk_out(
            self.endpoints.ep_out,
            self.token(TransferRole::Out),
            data,
            TRANSFER_TIMEOUT,
        ) {
            self.write_slot.buf = Some(Vec::new());
            self.submit_failed(err, reactor);
        }
    }

    fn submit_failed(&mut self, err: Error, reactor: &Reactor) {
        match err {
            Error::NoDevice => warn!("device gone on transfer submission"),
            err => error!("transfer submission failed: {err}"),
        }
        self.request_removal(true, reactor);
    }

    /// Route a finished transfer back into the state machine.
    pub(crate) fn on_completion(
        &mut self,
        role: TransferRole,
        status: TransferStatus,
        buffer: Vec<u8>,
        actual_len: usize,
        reactor: &Reactor,
    ) {
        match role {
            TransferRole::In0 | TransferRole::In1 => {
                let i = usize::from(role == TransferRole::In1);
                let slot = &mut self.read_slots[i];
                slot.actual = actual_len.min(buffer.len());
                slot.pos = 0;
                slot.buf = Some(buffer);
                match status {
                    TransferStatus::Completed => self.read_completed(i, reactor),
                    TransferStatus::TimedOut => self.resubmit_read(i, reactor),
                    TransferStatus::Cancelled | TransferStatus::NoDevice => {
                        self.request_removal(true, reactor);
                    }
                    status => {
                        error!("read transfer failed: {status:?}");
                        self.request_removal(true, reactor);
                    }
                }
            }
            TransferRole::Out => match status {
                TransferStatus::Completed => self.write_completed(buffer, actual_len, reactor),
                TransferStatus::TimedOut => {
                    // Nothing was sent; push the same data again.
                    self.submit_write(buffer, reactor);
                }
                TransferStatus::Cancelled | TransferStatus::NoDevice => {
                    self.write_slot.buf = Some(buffer);
                    self.request_removal(true, reactor);
                }
                status => {
                    error!("write transfer failed: {status:?}");
                    self.write_slot.buf = Some(buffer);
                    self.request_removal(true, reactor);
                }
            },
        }
    }

    fn read_completed(&mut self, i: usize, reactor: &Reactor) {
        let actual = self.read_slots[i].actual;
        let data = self.read_slots[i].buf.take();
        let offset = match data.as_deref() {
            Some(data) => self.driver.read_done(&data[..actual]),
            None => 0,
        };
        self.read_slots[i].buf = data;
        self.read_slots[i].pos = offset.min(actual);
        if self.pipeout_hangup {
            return;
        }
        if self.read_slots[i].pos >= actual {
            self.resubmit_read(i, reactor);
        } else {
            self.write_pipe(i, reactor);
        }
    }

    fn write_completed(&mut self, buffer: Vec<u8>, actual: usize, reactor: &Reactor) {
        if self.pipein_hangup {
            self.write_slot.buf = Some(buffer);
            return;
        }
        let len = self.write_slot.len;
        if actual < len {
            let mut data = buffer;
            if actual != 0 {
                data.copy_within(actual..len, 0);
            }
            data.truncate(len - actual);
            info!("partially complete transfer {actual}/{len}");
            self.submit_write(data, reactor);
        } else {
            self.driver.write_done();
            self.write_slot.buf = Some(buffer);
            self.read_pipe(reactor);
        }
    }

    /// Mark the channel for deletion once its hangup state warrants it.
    /// `enforce` records a device-level failure.
    pub(crate) fn request_removal(&mut self, enforce: bool, reactor: &Reactor) {
        self.device_hangup = self.device_hangup || enforce;
        if self.device_hangup || (self.pipein_hangup && self.pipeout_hangup) {
            self.close();
            reactor.request_removal(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockDevice};
    use crate::backend::{DeviceDesc, UsbBackend};
    use crate::driver::DriverRegistry;

    const CH340: DeviceDesc = DeviceDesc {
        vid: 0x1a86,
        pid: 0x7523,
        bus: 1,
        addr: 4,
        bcd_device: 0x0264,
        device_class: 0xff,
        max_packet_size_0: 8,
    };

    struct Fixture {
        channel: FileChannel,
        device: MockDevice,
        bus: MockBackend,
        reactor: Reactor,
        // Far pipe ends; app_write is droppable to simulate EOF.
        app_write: Option<OwnedFd>,
        app_read: OwnedFd,
    }

    fn fixture() -> Fixture {
        let bus = MockBackend::new();
        let device = bus.add_device(CH340);
        let handle = bus.open(&CH340).unwrap();
        let driver = DriverRegistry::with_stock_drivers()
            .create(&handle, 0)
            .unwrap();

        // app_write -> fd_read (engine reads), fd_write -> app_read
        let (engine_read, app_write) = nix::unistd::pipe().unwrap();
        let (app_read, engine_write) = nix::unistd::pipe().unwrap();
        let io = Channel {
            fd_read: engine_read.as_raw_fd(),
            fd_write: engine_write.as_raw_fd(),
        };
        let key = ChannelKey { index: 0, gen: 1 };
        let mut channel = FileChannel::new(
            key,
            handle,
            driver,
            io,
            io,
            vec![engine_read, engine_write],
        )
        .unwrap();
        let reactor = Reactor::default();
        channel.init(&reactor).unwrap();
        Fixture {
            channel,
            device,
            bus,
            reactor,
            app_write: Some(app_write),
            app_read,
        }
    }

    fn pump(fx: &mut Fixture) {
        for completion in fx.bus.handle_events(Duration::ZERO).unwrap() {
            fx.channel.on_completion(
                completion.token.role,
                completion.status,
                completion.buffer,
                completion.actual_len,
                &fx.reactor,
            );
        }
    }

    fn read_app(fx: &Fixture, max: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max];
        set_nonblocking(fx.app_read.as_raw_fd()).unwrap();
        match nix::unistd::read(fx.app_read.as_raw_fd(), &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(Errno::EAGAIN) => Vec::new(),
            Err(e) => panic!("read: {e}"),
        }
    }

    #[test]
    fn init_submits_both_in_transfers_and_parks_the_read_fd() {
        let fx = fixture();
        assert_eq!(fx.device.pending_in_count(), 2);
        // Empty pipe: the read fd must be waiting on the poll list.
        assert_eq!(fx.reactor.poll_list.lock().len(), 1);
        assert!(fx.channel.busy());
    }

    #[test]
    fn inbound_bytes_reach_the_write_fd() {
        let mut fx = fixture();
        fx.device.inject_in(b"hello");
        pump(&mut fx);
        assert_eq!(read_app(&fx, 64), b"hello");
        // The drained transfer went straight back to the device.
        assert_eq!(fx.device.pending_in_count(), 2);
    }

    #[test]
    fn read_positions_stay_within_bounds() {
        let mut fx = fixture();
        fx.device.inject_in(&[0x55; 100]);
        pump(&mut fx);
        for slot in &fx.channel.read_slots {
            assert!(slot.pos <= slot.actual);
            assert!(slot.actual <= fx.channel.endpoints.chunk_size);
        }
    }

    #[test]
    fn outbound_bytes_are_submitted_as_one_transfer() {
        let mut fx = fixture();
        nix::unistd::write(fx.app_write.as_ref().unwrap(), b"abc").unwrap();
        // The read fd was parked; simulate its readiness.
        fx.channel.set_events(PollFlags::POLLIN, true, &fx.reactor);
        fx.channel.events(&fx.reactor);
        assert_eq!(fx.device.pending_out_data().unwrap(), b"abc");
    }

    #[test]
    fn partial_out_completion_resubmits_the_tail() {
        let mut fx = fixture();
        nix::unistd::write(fx.app_write.as_ref().unwrap(), b"abcdef").unwrap();
        fx.channel.set_events(PollFlags::POLLIN, true, &fx.reactor);
        fx.channel.events(&fx.reactor);
        fx.device.complete_out(2);
        pump(&mut fx);
        assert_eq!(fx.device.pending_out_data().unwrap(), b"cdef");
    }

    #[test]
    fn full_out_completion_refills_from_the_read_fd() {
        let mut fx = fixture();
        nix::unistd::write(fx.app_write.as_ref().unwrap(), b"first").unwrap();
        fx.channel.set_events(PollFlags::POLLIN, true, &fx.reactor);
        fx.channel.events(&fx.reactor);
        nix::unistd::write(fx.app_write.as_ref().unwrap(), b"second").unwrap();
        fx.device.complete_out_full();
        pump(&mut fx);
        assert_eq!(fx.device.pending_out_data().unwrap(), b"second");
    }

    #[test]
    fn close_cancels_and_reports_busy_until_completions_arrive() {
        let mut fx = fixture();
        assert!(!fx.channel.close());
        assert!(fx.channel.busy());
        assert_eq!(fx.device.cancelled_endpoints(), vec![0x82]);
        pump(&mut fx);
        assert!(!fx.channel.busy());
    }

    #[test]
    fn in_timeout_is_benign_and_resubmits() {
        let mut fx = fixture();
        fx.device.timeout_in();
        pump(&mut fx);
        assert_eq!(fx.device.pending_in_count(), 2);
        assert_eq!(fx.channel.status() & Status::ALLES_GUTE, Status::ALLES_GUTE);
    }

    #[test]
    fn in_stall_schedules_removal() {
        let mut fx = fixture();
        fx.device.fail_in(TransferStatus::Stall);
        pump(&mut fx);
        assert!(fx.reactor.delete_list.lock().contains(&fx.channel.key()));
        assert!(!fx.channel.status().contains(Status::USB_DEV_OK));
    }

    #[test]
    fn eof_on_read_fd_sets_only_the_inbound_hangup() {
        let mut fx = fixture();
        fx.app_write.take();
        fx.channel.set_events(PollFlags::POLLIN, true, &fx.reactor);
        fx.channel.events(&fx.reactor);
        let status = fx.channel.status();
        assert!(!status.contains(Status::READ_PIPE_OK));
        assert!(status.contains(Status::WRITE_PIPE_OK));
        assert!(fx.reactor.delete_list.lock().is_empty());
    }
}
