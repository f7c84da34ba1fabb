//! Public parameter and identity types.
//!
//! These are the EIA/TIA-232 line parameters a channel is configured with,
//! the two ways a USB device can be addressed, and the descriptor pair that
//! names a channel.

use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};

/// Parity setting for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always 1.
    Mark,
    /// Parity bit always 0.
    Space,
}

impl Parity {
    /// The on-wire encoding shared by the FTDI and PL2303 protocols.
    pub(crate) fn wire_value(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }
}

/// Number of stop bits for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// One and a half stop bits.
    OneAndHalf,
    /// Two stop bits.
    Two,
}

impl StopBits {
    pub(crate) fn wire_value(self) -> u8 {
        match self {
            StopBits::One => 0,
            StopBits::OneAndHalf => 1,
            StopBits::Two => 2,
        }
    }
}

/// Flow control mode for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// RTS/CTS hardware flow control.
    RtsCts,
    /// DTR/DSR hardware flow control.
    DtrDsr,
    /// XON/XOFF software flow control.
    XonXoff,
}

/// Complete EIA/TIA-232 line configuration.
///
/// `databits` must be in `5..=9`; a zero `baudrate` is rejected at attach
/// time. The associated constants cover the configurations seen in
/// practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineParams {
    /// Baud rate in bits per second. Must be nonzero.
    pub baudrate: u32,
    /// Number of data bits (5..=9).
    pub databits: u8,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stopbits: StopBits,
    /// Flow control.
    pub flowcontrol: FlowControl,
}

impl LineParams {
    /// 115200 baud, 8 data bits, no parity, one stop bit, no flow control.
    pub const B115200_8N1: LineParams = LineParams {
        baudrate: 115_200,
        databits: 8,
        parity: Parity::None,
        stopbits: StopBits::One,
        flowcontrol: FlowControl::None,
    };

    /// 115200 8N1 with RTS/CTS flow control.
    pub const B115200_8N1_RTSCTS: LineParams = LineParams {
        flowcontrol: FlowControl::RtsCts,
        ..Self::B115200_8N1
    };

    /// 19200 baud, 8 data bits, no parity, one stop bit, no flow control.
    pub const B19200_8N1: LineParams = LineParams {
        baudrate: 19_200,
        ..Self::B115200_8N1
    };

    /// 19200 8N1 with RTS/CTS flow control.
    pub const B19200_8N1_RTSCTS: LineParams = LineParams {
        baudrate: 19_200,
        flowcontrol: FlowControl::RtsCts,
        ..Self::B115200_8N1
    };
}

/// USB device addressed by vendor id, product id and interface number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Interface number on the device (0 for single-interface chips).
    pub ifc: u8,
}

/// USB device addressed by bus number, device address and interface number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddr {
    /// USB bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub addr: u8,
    /// Interface number on the device.
    pub ifc: u8,
}

/// Either way of naming a device. Facade methods take `impl Into<DeviceRef>`
/// so both [`DeviceId`] and [`DeviceAddr`] are accepted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRef {
    /// Match by vendor/product id.
    Id(DeviceId),
    /// Match by bus number and device address.
    Addr(DeviceAddr),
}

impl DeviceRef {
    /// The interface number carried by either addressing form.
    pub fn interface(&self) -> u8 {
        match self {
            DeviceRef::Id(id) => id.ifc,
            DeviceRef::Addr(a) => a.ifc,
        }
    }
}

impl From<DeviceId> for DeviceRef {
    fn from(id: DeviceId) -> Self {
        DeviceRef::Id(id)
    }
}

impl From<DeviceAddr> for DeviceRef {
    fn from(addr: DeviceAddr) -> Self {
        DeviceRef::Addr(addr)
    }
}

/// A channel: the pair of host file descriptors bound to one USB interface.
///
/// The engine reads outbound serial bytes from `fd_read` and writes
/// received serial bytes to `fd_write`. The pair also serves as the lookup
/// key for facade calls; a channel matches if either descriptor matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    /// Descriptor the engine reads outbound data from.
    pub fd_read: RawFd,
    /// Descriptor the engine writes received data to.
    pub fd_write: RawFd,
}

bitflags::bitflags! {
    /// Channel health and line-error bits returned by `status`.
    ///
    /// The low three bits report the three viability flags; the high bits
    /// carry accumulated line errors reported by the device driver (FTDI
    /// parts report these in their per-packet status prefix).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// The inbound descriptor is still usable.
        const READ_PIPE_OK = 1;
        /// The outbound descriptor is still usable.
        const WRITE_PIPE_OK = 2;
        /// The USB device is still present and responding.
        const USB_DEV_OK = 4;
        /// Receiver overrun was observed.
        const OVERRUN = 0x10;
        /// A parity error was observed.
        const PARITY_ERR = 0x20;
        /// A framing error was observed.
        const FRAMING_ERR = 0x40;
        /// A break condition was observed.
        const BREAK_INT = 0x80;
    }
}

impl Status {
    /// All three viability bits set, no line errors.
    pub const ALLES_GUTE: Status = Status::READ_PIPE_OK
        .union(Status::WRITE_PIPE_OK)
        .union(Status::USB_DEV_OK);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alles_gute_is_the_three_ok_bits() {
        assert_eq!(Status::ALLES_GUTE.bits(), 7);
    }

    #[test]
    fn line_error_bits_do_not_collide_with_ok_bits() {
        let errors = Status::OVERRUN | Status::PARITY_ERR | Status::FRAMING_ERR | Status::BREAK_INT;
        assert!((errors & Status::ALLES_GUTE).is_empty());
    }

    #[test]
    fn device_ref_carries_interface() {
        let id = DeviceId {
            vid: 0x0403,
            pid: 0x6001,
            ifc: 1,
        };
        assert_eq!(DeviceRef::from(id).interface(), 1);
        let addr = DeviceAddr {
            bus: 3,
            addr: 7,
            ifc: 0,
        };
        assert_eq!(DeviceRef::from(addr).interface(), 0);
    }
}
