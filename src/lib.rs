//! Relay engine bridging USB-to-serial converter chips to host file
//! descriptors.
//!
//! This crate binds a USB-to-UART converter (FTDI, CH340/CH341, Prolific
//! PL2303 and compatibles) to a pair of host file descriptors and shuttles
//! bytes between the USB bulk endpoints and the descriptors as a
//! full-duplex stream. An application reads received serial bytes from one
//! descriptor and writes outbound bytes to the other; the engine performs
//! endpoint management, vendor framing and flow control transparently.
//!
//! # Quick start
//!
//! ```no_run
//! use usbuart::{Context, DeviceId, LineParams};
//!
//! let ctx = Context::new();
//! // Bridge the first FT232 to a fresh pair of pipes.
//! let ch = ctx.pipe(
//!     DeviceId { vid: 0x0403, pid: 0x6001, ifc: 0 },
//!     &LineParams::B115200_8N1,
//! )?;
//! // Pump until the last channel is gone.
//! while ctx.run_once(std::time::Duration::from_millis(100))? > 0 {}
//! # Ok::<(), usbuart::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`Context`] — facade and event loop: attach, pipe, close, reset,
//!   break, status, and the `run_once` pump.
//! - [`driver`] — per-chip drivers behind the
//!   [`SerialDriver`](driver::SerialDriver) trait, dispatched through a
//!   [`DriverRegistry`](driver::DriverRegistry).
//! - [`backend`] — the USB host-stack contract, with a
//!   [`nusb`](backend::nusb::NusbBackend)-based implementation for real
//!   hardware and a scriptable [`mock`](backend::mock::MockBackend) bus
//!   for tests.
//!
//! One thread drives [`Context::run_once`] in a loop; every other method
//! is safe to call concurrently from any thread.

pub mod backend;
mod channel;
pub mod context;
pub mod driver;
pub mod error;
pub mod types;

// ---- Convenience re-exports ----

pub use context::Context;
pub use error::{Error, Result};
pub use types::{
    Channel, DeviceAddr, DeviceId, DeviceRef, FlowControl, LineParams, Parity, Status, StopBits,
};
