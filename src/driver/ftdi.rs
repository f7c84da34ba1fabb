//! Driver for FTDI USB-to-serial converters (FT232, FT2232, FT4232,
//! FT232H, FT230X).
//!
//! FTDI parts program their baud generator through a fractional divisor
//! encoded into the `value`/`index` words of a vendor request, and prepend
//! two modem-status bytes to every bulk IN packet. Bit errors reported in
//! the second status byte are accumulated and surfaced through the channel
//! status word.

use std::sync::Arc;

use log::warn;

use crate::backend::UsbDevice;
use crate::driver::{BulkEndpoints, ControlOps, SerialDriver};
use crate::error::{Error, Result};
use crate::types::{FlowControl, LineParams, Status};

const FTDI_VID: u16 = 0x0403;

/// Product ids this driver accepts.
const PRODUCTS: [u16; 5] = [0x6001, 0x6010, 0x6011, 0x6014, 0x6015];

// ---- SIO vendor request codes ----

/// Reset the port.
const SIO_RESET_REQUEST: u8 = 0x00;
/// Set flow control register.
const SIO_SET_FLOW_CTRL_REQUEST: u8 = 0x02;
/// Set baud rate.
const SIO_SET_BAUDRATE_REQUEST: u8 = 0x03;
/// Set data characteristics (bits, parity, stop).
const SIO_SET_DATA_REQUEST: u8 = 0x04;

// ---- Flow control values (high byte of wIndex) ----

const SIO_RTS_CTS_HS: u16 = 0x1 << 8;
const SIO_DTR_DSR_HS: u16 = 0x2 << 8;
const SIO_XON_XOFF_HS: u16 = 0x4 << 8;

/// XON/XOFF control characters (DC1/DC3).
const XON_CHAR: u16 = 0x11;
const XOFF_CHAR: u16 = 0x13;

// ---- Baud generator ----

/// H-type base clock: 120 MHz.
const H_CLK: u32 = 120_000_000;
/// Standard base clock: 48 MHz.
const C_CLK: u32 = 48_000_000;

/// Fractional sub-divisor encoding: the low three bits of the raw divisor
/// select value bits 14..15 and index bit 8.
const FRAC_MAPPER: [u16; 8] = [
    0x0000, 0xC000, 0x8000, 0x0100, 0x4000, 0x4100, 0x8100, 0xC100,
];

/// Rates at or below this would overflow the 14-bit divisor with the /10
/// prescaler, so high-speed parts fall back to /16 for them.
const LOW_LIMIT: u32 = (H_CLK / 10) >> 14;

// ---- IN-packet status prefix ----

/// Length of the modem-status prefix on every IN packet.
const STATUS_PREFIX: usize = 2;

const OVERRUN_BIT: u8 = 1 << 1;
const PARITY_BIT: u8 = 1 << 2;
const FRAMING_BIT: u8 = 1 << 3;
const BREAK_BIT: u8 = 1 << 4;

const ERROR_MASK: u8 = OVERRUN_BIT | PARITY_BIT | FRAMING_BIT | BREAK_BIT;

/// Per-interface endpoints on multi-port (high-speed) parts.
const H_ENDPOINTS: [BulkEndpoints; 4] = [
    BulkEndpoints { ep_in: 0x81, ep_out: 0x02, chunk_size: CHUNK },
    BulkEndpoints { ep_in: 0x83, ep_out: 0x04, chunk_size: CHUNK },
    BulkEndpoints { ep_in: 0x85, ep_out: 0x06, chunk_size: CHUNK },
    BulkEndpoints { ep_in: 0x87, ep_out: 0x08, chunk_size: CHUNK },
];

const L_ENDPOINTS: BulkEndpoints = BulkEndpoints {
    ep_in: 0x81,
    ep_out: 0x02,
    chunk_size: CHUNK,
};

/// Transfers larger than one max-size packet would interleave the per-packet
/// status bytes into the payload, so reads stay at one packet.
const CHUNK: usize = 64;

/// Compute the `value`/`index` words for `SIO_SET_BAUDRATE_REQUEST`.
///
/// The raw divisor is `clk * 8 / baud / prescaler`, rounded; its low three
/// bits select the fractional encoding from [`FRAC_MAPPER`]. High-speed
/// parts use the /10 prescaler (and flag it in `index`) whenever the
/// divisor still fits 14 bits.
fn compute_divisors(baudrate: u32, high_speed: bool) -> (u16, u16) {
    let clk = if high_speed { H_CLK } else { C_CLK };
    let prescaler: u32 = if high_speed && baudrate > LOW_LIMIT {
        10
    } else {
        16
    };
    let mut divisor = (((clk as u64) << 3) / baudrate as u64 + (prescaler as u64 >> 1) - 1) as u32;
    divisor /= prescaler;
    let frac = FRAC_MAPPER[(divisor & 7) as usize];
    let index = (frac & 0x0100) | if prescaler == 10 { 0x0200 } else { 0 };
    let value = ((divisor >> 3) & 0x3FFF) as u16 | (frac & 0xC000);
    (value, index)
}

pub(crate) struct Ftdi {
    control: ControlOps,
    endpoints: BulkEndpoints,
    high_speed: bool,
    /// Accumulated raw error bits from the status prefix. Sticky: a clean
    /// read does not clear previously recorded errors.
    errors: u8,
}

impl SerialDriver for Ftdi {
    fn endpoints(&self) -> BulkEndpoints {
        self.endpoints
    }

    fn setup(&mut self, line: &LineParams) -> Result<()> {
        self.set_baudrate(line.baudrate)?;
        self.set_line_properties(line)?;
        self.set_flow_control(line.flowcontrol)?;
        self.reset()
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        let ifc = self.control.interface() as u16;
        let (value, index) = compute_divisors(baudrate, self.high_speed);
        log::info!("baudrate={baudrate} value={value:#06x} index={index:#06x}");
        self.control
            .write_cv(SIO_SET_BAUDRATE_REQUEST, value, index | ifc)
    }

    fn reset(&mut self) -> Result<()> {
        self.control
            .write_cv(SIO_RESET_REQUEST, 0, self.control.interface() as u16)
    }

    fn read_done(&mut self, data: &[u8]) -> usize {
        if data.len() < STATUS_PREFIX {
            warn!("malformed transfer of {} bytes", data.len());
            return data.len();
        }
        let errors = data[1] & ERROR_MASK;
        if errors != 0 {
            self.errors |= errors;
            warn!(
                "line error {errors:#04x}:{}{}{}{}",
                if errors & BREAK_BIT != 0 { " break" } else { "" },
                if errors & FRAMING_BIT != 0 { " framing" } else { "" },
                if errors & PARITY_BIT != 0 { " parity" } else { "" },
                if errors & OVERRUN_BIT != 0 { " overrun" } else { "" },
            );
        }
        STATUS_PREFIX
    }

    fn line_errors(&self) -> Status {
        let mut status = Status::empty();
        if self.errors & OVERRUN_BIT != 0 {
            status |= Status::OVERRUN;
        }
        if self.errors & PARITY_BIT != 0 {
            status |= Status::PARITY_ERR;
        }
        if self.errors & FRAMING_BIT != 0 {
            status |= Status::FRAMING_ERR;
        }
        if self.errors & BREAK_BIT != 0 {
            status |= Status::BREAK_INT;
        }
        status
    }
}

impl Ftdi {
    fn set_line_properties(&self, line: &LineParams) -> Result<()> {
        let value = line.databits as u16
            | (line.parity.wire_value() as u16) << 8
            | (line.stopbits.wire_value() as u16) << 11;
        self.control
            .write_cv(SIO_SET_DATA_REQUEST, value, self.control.interface() as u16)
    }

    fn set_flow_control(&self, flow: FlowControl) -> Result<()> {
        let ifc = self.control.interface() as u16;
        let (value, index) = match flow {
            FlowControl::None => (0, 0),
            FlowControl::RtsCts => (0, SIO_RTS_CTS_HS),
            FlowControl::DtrDsr => (0, SIO_DTR_DSR_HS),
            FlowControl::XonXoff => (XON_CHAR | (XOFF_CHAR << 8), SIO_XON_XOFF_HS),
        };
        self.control
            .write_cv(SIO_SET_FLOW_CTRL_REQUEST, value, index | ifc)
    }
}

/// Factory entry for the registry.
pub(crate) fn probe(dev: &Arc<dyn UsbDevice>, ifc: u8) -> Result<Option<Box<dyn SerialDriver>>> {
    let desc = dev.descriptor();
    if desc.vid != FTDI_VID || !PRODUCTS.contains(&desc.pid) {
        return Ok(None);
    }

    // The 0x6010 pid covers both FT2232C/D (full speed) and FT2232H; only
    // bcdDevice tells them apart.
    let high_speed = match desc.pid {
        0x6010 => desc.bcd_device == 0x0700,
        0x6011 | 0x6014 => true,
        _ => false,
    };

    let endpoints = if high_speed {
        match H_ENDPOINTS.get(ifc as usize) {
            Some(&ep) => ep,
            None => return Err(Error::InvalidParam("interface")),
        }
    } else {
        if ifc != 0 {
            return Err(Error::InvalidParam("interface"));
        }
        L_ENDPOINTS
    };

    let control = ControlOps::claim(dev.clone(), ifc)?;
    Ok(Some(Box::new(Ftdi {
        control,
        endpoints,
        high_speed,
        errors: 0,
    })))
}
