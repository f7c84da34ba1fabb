//! Shared fixture for engine tests: a context over the mock bus with one
//! attached device and real pipes on both sides.

#![allow(dead_code)]

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use usbuart::backend::mock::{MockBackend, MockDevice};
use usbuart::backend::DeviceDesc;
use usbuart::{Channel, Context, DeviceId, LineParams};

pub const FT232: DeviceDesc = DeviceDesc {
    vid: 0x0403,
    pid: 0x6001,
    bus: 1,
    addr: 5,
    bcd_device: 0x0600,
    device_class: 0x00,
    max_packet_size_0: 8,
};

pub const CH340: DeviceDesc = DeviceDesc {
    vid: 0x1a86,
    pid: 0x7523,
    bus: 1,
    addr: 6,
    bcd_device: 0x0264,
    device_class: 0xff,
    max_packet_size_0: 8,
};

pub fn device_id(desc: &DeviceDesc) -> DeviceId {
    DeviceId {
        vid: desc.vid,
        pid: desc.pid,
        ifc: 0,
    }
}

pub fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

pub fn set_nonblocking(fd: RawFd) {
    let flags = fcntl(fd, FcntlArg::F_GETFL).unwrap();
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).unwrap();
}

/// A context over the mock bus with one device attached through real
/// pipes. `app_write` feeds the channel's read descriptor; `app_read`
/// observes what the channel writes.
pub struct Harness {
    // Dropped first, while the engine-side descriptors are still open.
    pub ctx: Context,
    pub bus: MockBackend,
    pub dev: MockDevice,
    pub ch: Channel,
    pub engine_ends: Vec<OwnedFd>,
    pub app_write: Option<OwnedFd>,
    pub app_read: OwnedFd,
}

impl Harness {
    pub fn attach(desc: DeviceDesc) -> Harness {
        Self::attach_with(desc, &LineParams::B115200_8N1)
    }

    pub fn attach_with(desc: DeviceDesc, line: &LineParams) -> Harness {
        let bus = MockBackend::new();
        let dev = bus.add_device(desc);
        let ctx = Context::with_backend(Box::new(bus.clone()));

        let (engine_read, app_write) = nix::unistd::pipe().unwrap();
        let (app_read, engine_write) = nix::unistd::pipe().unwrap();
        let ch = Channel {
            fd_read: engine_read.as_raw_fd(),
            fd_write: engine_write.as_raw_fd(),
        };
        ctx.attach(device_id(&desc), ch, line).unwrap();
        set_nonblocking(app_read.as_raw_fd());

        Harness {
            ctx,
            bus,
            dev,
            ch,
            engine_ends: vec![engine_read, engine_write],
            app_write: Some(app_write),
            app_read,
        }
    }

    /// Run the loop `iterations` times; returns the last live-channel
    /// count.
    pub fn spin(&self, iterations: usize) -> usize {
        let mut live = usize::MAX;
        for _ in 0..iterations {
            live = self.ctx.run_once(Duration::from_millis(1)).unwrap();
        }
        live
    }

    /// Feed application bytes into the channel's read descriptor.
    pub fn send(&self, data: &[u8]) {
        nix::unistd::write(self.app_write.as_ref().unwrap(), data).unwrap();
    }

    /// Non-blocking read of whatever the channel has delivered so far.
    pub fn recv(&self, max: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max];
        match nix::unistd::read(self.app_read.as_raw_fd(), &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(Errno::EAGAIN) => Vec::new(),
            Err(err) => panic!("recv: {err}"),
        }
    }

    /// Spin the loop until `expected` bytes have been delivered (or the
    /// spin budget runs out) and return them.
    pub fn recv_exactly(&self, expected: usize, max_spins: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        for _ in 0..max_spins {
            self.spin(1);
            collected.extend(self.recv(expected));
            if collected.len() >= expected {
                break;
            }
        }
        collected
    }
}
