//! Driver for WCH CH340/CH341 USB-to-serial converters.
//!
//! The CH34x baud generator is programmed with two opaque divisor words
//! taken from a fixed table; rates outside the table are rejected. The
//! chip delivers payload with no in-band status bytes.

use std::sync::Arc;

use log::info;

use crate::backend::UsbDevice;
use crate::driver::{BulkEndpoints, ControlOps, SerialDriver};
use crate::error::{Error, Result};
use crate::types::{FlowControl, LineParams};

/// Supported vendor/product pairs.
const PRODUCTS: [(u16, u16); 3] = [(0x4348, 0x5523), (0x1a86, 0x7523), (0x1a86, 0x5523)];

/// Serial-init vendor request carrying the two divisor registers.
const SERIAL_INIT_REQUEST: u8 = 0x9a;
/// Vendor-init request used during probing.
const VENDOR_INIT_REQUEST: u8 = 0xa1;
/// Modem-control request; the flow register lives in its value word.
const MODEM_CTRL_REQUEST: u8 = 0xa4;

/// Register addresses for the two divisor words.
const BAUD_DIVISOR_REG: u16 = 0x1312;
const BAUD_MOD_REG: u16 = 0x0f2c;

const ENDPOINTS: BulkEndpoints = BulkEndpoints {
    ep_in: 0x82,
    ep_out: 0x02,
    chunk_size: 256,
};

/// Divisor words per supported rate.
const BAUD_TABLE: [(u32, u16, u16); 7] = [
    (2_400, 0xd901, 0x0038),
    (4_800, 0x6402, 0x001f),
    (9_600, 0xb202, 0x0013),
    (19_200, 0xd902, 0x000d),
    (38_400, 0x6403, 0x000a),
    (57_600, 0x9803, 0x0010),
    (115_200, 0xcc03, 0x0008),
];

pub(crate) struct Ch34x {
    control: ControlOps,
}

impl Ch34x {
    /// Wake-and-verify sequence issued before the chip is trusted.
    fn probe_device(&self) -> Result<()> {
        let steps = [
            (VENDOR_INIT_REQUEST, 0u16, 0u16),
            (SERIAL_INIT_REQUEST, 0x2518, 0x0050),
            (VENDOR_INIT_REQUEST, 0x501f, 0xd90a),
        ];
        for (request, value, index) in steps {
            self.control
                .write_cv(request, value, index)
                .map_err(|_| Error::ProbeMismatch)?;
        }
        Ok(())
    }

    fn set_flow_control(&self, flow: FlowControl) -> Result<()> {
        let value: u16 = match flow {
            FlowControl::RtsCts => !(1 << 6),
            FlowControl::DtrDsr => !(1 << 5),
            _ => 0x00ff,
        };
        self.control.write_cv(MODEM_CTRL_REQUEST, value, 0)
    }
}

impl SerialDriver for Ch34x {
    fn endpoints(&self) -> BulkEndpoints {
        ENDPOINTS
    }

    fn setup(&mut self, line: &LineParams) -> Result<()> {
        self.set_baudrate(line.baudrate)?;
        self.set_flow_control(line.flowcontrol)?;
        self.reset()
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        for (rate, div1, div2) in BAUD_TABLE {
            if rate == baudrate {
                self.control
                    .write_cv(SERIAL_INIT_REQUEST, BAUD_DIVISOR_REG, div1)?;
                return self.control.write_cv(SERIAL_INIT_REQUEST, BAUD_MOD_REG, div2);
            }
        }
        Err(Error::BadBaudrate(baudrate))
    }

    // No documented sequence for resetting the chip; the default no-op
    // reset and the zero payload offset of `read_done` both apply.
}

/// Factory entry for the registry.
pub(crate) fn probe(dev: &Arc<dyn UsbDevice>, ifc: u8) -> Result<Option<Box<dyn SerialDriver>>> {
    let desc = dev.descriptor();
    if !PRODUCTS.contains(&(desc.vid, desc.pid)) {
        return Ok(None);
    }
    info!("probing ch34x {:04x}:{:04x}", desc.vid, desc.pid);
    let control = ControlOps::claim(dev.clone(), ifc)?;
    let driver = Ch34x { control };
    driver.probe_device()?;
    Ok(Some(Box::new(driver)))
}
