//! Driver for Prolific PL2303 USB-to-serial converters.
//!
//! Line parameters travel in a packed 7-byte structure exchanged with
//! class requests; bring-up is a fixed dance over vendor init registers.
//! The HX generation adds distinct read/write FIFO resets and is detected
//! from the device descriptor alone.

use std::sync::Arc;

use log::info;

use crate::backend::{DeviceDesc, UsbDevice};
use crate::driver::{BulkEndpoints, ControlOps, SerialDriver};
use crate::error::{Error, Result};
use crate::types::LineParams;

/// Supported vendor/product pairs (Prolific plus common OEM rebrands).
const PRODUCTS: [(u16, u16); 7] = [
    (0x067b, 0x2303),
    (0x067b, 0x04bb),
    (0x067b, 0x1234),
    (0x067b, 0xaaa2),
    (0x0557, 0x2008),
    (0x04bb, 0x0a03),
    (0x056e, 0x5003),
];

/// Vendor init-register request used by the probe sequence.
const INIT_REQUEST: u8 = 0x01;

/// GET_LINE_CODING: class | interface, device-to-host.
const GET_LINE_RQT: u8 = 0xa1;
const GET_LINE_REQ: u8 = 0x21;
/// SET_LINE_CODING: class | interface, host-to-device.
const SET_LINE_RQT: u8 = 0x21;
const SET_LINE_REQ: u8 = 0x20;
/// BREAK: class | interface, host-to-device.
const BREAK_RQT: u8 = 0x21;
const BREAK_REQ: u8 = 0x23;

/// HX FIFO resets.
const RESET_RD_REQ: u8 = 0x08;
const RESET_WR_REQ: u8 = 0x09;

/// Size of the packed line-coding payload:
/// `{ baudrate: u32 le, stopbits: u8, parity: u8, databits: u8 }`.
const LINE_CODING_LEN: usize = 7;

const ENDPOINTS: BulkEndpoints = BulkEndpoints {
    ep_in: 0x83,
    ep_out: 0x02,
    chunk_size: 256,
};

pub(crate) struct Pl2303 {
    control: ControlOps,
    /// HX-generation part with the extra FIFO reset registers.
    hx: bool,
}

impl Pl2303 {
    /// The "magic" init-register sequence every known host driver issues
    /// before using the chip. Any hiccup marks the probe as mismatched.
    fn probe_device(&self) -> Result<()> {
        let probe = || -> Result<()> {
            self.control.read_cv_u8(INIT_REQUEST, 0x8484)?;
            self.control.write_cv(INIT_REQUEST, 0x0404, 0)?;
            self.control.read_cv_u8(INIT_REQUEST, 0x8484)?;
            self.control.read_cv_u8(INIT_REQUEST, 0x8383)?;
            self.control.read_cv_u8(INIT_REQUEST, 0x8484)?;
            self.control.write_cv(INIT_REQUEST, 0x0404, 1)?;
            self.control.read_cv_u8(INIT_REQUEST, 0x8484)?;
            self.control.read_cv_u8(INIT_REQUEST, 0x8383)?;
            self.control.write_cv(INIT_REQUEST, 0x0000, 1)?;
            self.control.write_cv(INIT_REQUEST, 0x0001, 0)?;
            self.control.write_cv(INIT_REQUEST, 0x0002, 0x44)?;
            Ok(())
        };
        probe().map_err(|_| Error::ProbeMismatch)
    }

    fn get_line_coding(&self) -> Result<[u8; LINE_CODING_LEN]> {
        let mut coding = [0u8; LINE_CODING_LEN];
        self.control
            .control_in(GET_LINE_RQT, GET_LINE_REQ, 0, 0, &mut coding)?;
        Ok(coding)
    }

    fn set_line_coding(&self, coding: &[u8; LINE_CODING_LEN]) -> Result<()> {
        self.control
            .control_out(SET_LINE_RQT, SET_LINE_REQ, 0, 0, coding)
    }
}

impl SerialDriver for Pl2303 {
    fn endpoints(&self) -> BulkEndpoints {
        ENDPOINTS
    }

    fn setup(&mut self, line: &LineParams) -> Result<()> {
        let mut coding = [0u8; LINE_CODING_LEN];
        coding[..4].copy_from_slice(&line.baudrate.to_le_bytes());
        coding[4] = line.stopbits.wire_value();
        coding[5] = line.parity.wire_value();
        coding[6] = line.databits;
        info!(
            "line coding {{{},{},{},{}}}",
            line.baudrate, coding[6], coding[5], coding[4]
        );
        self.set_line_coding(&coding)?;
        self.reset()
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        let mut coding = self.get_line_coding()?;
        coding[..4].copy_from_slice(&baudrate.to_le_bytes());
        self.set_line_coding(&coding)
    }

    fn reset(&mut self) -> Result<()> {
        if self.hx {
            self.control.write_cv(RESET_RD_REQ, 0, 0)?;
            self.control.write_cv(RESET_WR_REQ, 0, 0)?;
        }
        // Legacy parts have no documented reset sequence.
        Ok(())
    }

    fn send_break(&mut self) -> Result<()> {
        self.control.control_out(BREAK_RQT, BREAK_REQ, 0, 0, &[])
    }
}

/// HX parts identify through descriptor shape rather than ids.
fn is_hx(desc: &DeviceDesc) -> bool {
    desc.device_class != 0x00
        && desc.device_class != 0x02
        && desc.device_class != 0xff
        && desc.max_packet_size_0 == 0x40
}

/// Factory entry for the registry.
pub(crate) fn probe(dev: &Arc<dyn UsbDevice>, ifc: u8) -> Result<Option<Box<dyn SerialDriver>>> {
    let desc = dev.descriptor();
    if !PRODUCTS.contains(&(desc.vid, desc.pid)) {
        return Ok(None);
    }
    info!("probing pl2303 for {:04x}:{:04x}", desc.vid, desc.pid);
    let control = ControlOps::claim(dev.clone(), ifc)?;
    let driver = Pl2303 {
        control,
        hx: is_hx(&desc),
    };
    driver.probe_device()?;
    Ok(Some(Box::new(driver)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockDevice};
    use crate::backend::UsbBackend;
    use crate::types::{Parity, StopBits};

    fn open_pl2303(device_class: u8, mps0: u8) -> (MockDevice, Arc<dyn UsbDevice>) {
        let bus = MockBackend::new();
        let desc = DeviceDesc {
            vid: 0x067b,
            pid: 0x2303,
            bus: 0,
            addr: 1,
            bcd_device: 0x0300,
            device_class,
            max_packet_size_0: mps0,
        };
        let handle = bus.add_device(desc);
        (handle, bus.open(&desc).unwrap())
    }

    #[test]
    fn probe_issues_eleven_init_steps() {
        let (handle, dev) = open_pl2303(0x00, 0x40);
        assert!(probe(&dev, 0).unwrap().is_some());
        let controls = handle.controls();
        assert_eq!(controls.len(), 11);
        assert!(controls.iter().all(|c| c.request == INIT_REQUEST));
        assert_eq!((controls[10].value, controls[10].index), (0x0002, 0x44));
    }

    #[test]
    fn hx_detection_follows_descriptor_shape() {
        let hx = DeviceDesc {
            vid: 0x067b,
            pid: 0x2303,
            bus: 0,
            addr: 1,
            bcd_device: 0,
            device_class: 0x03,
            max_packet_size_0: 0x40,
        };
        assert!(is_hx(&hx));
        assert!(!is_hx(&DeviceDesc {
            device_class: 0x00,
            ..hx
        }));
        assert!(!is_hx(&DeviceDesc {
            device_class: 0xff,
            ..hx
        }));
        assert!(!is_hx(&DeviceDesc {
            max_packet_size_0: 0x08,
            ..hx
        }));
    }

    #[test]
    fn setup_packs_the_line_coding() {
        let (handle, dev) = open_pl2303(0x00, 0x40);
        let mut driver = probe(&dev, 0).unwrap().unwrap();
        driver
            .setup(&LineParams {
                baudrate: 38_400,
                databits: 7,
                parity: Parity::Even,
                stopbits: StopBits::Two,
                flowcontrol: Default::default(),
            })
            .unwrap();
        let set = handle
            .controls()
            .into_iter()
            .rev()
            .find(|c| c.request == SET_LINE_REQ && c.request_type == SET_LINE_RQT)
            .unwrap();
        let mut expected = vec![0u8; 7];
        expected[..4].copy_from_slice(&38_400u32.to_le_bytes());
        expected[4] = 2; // two stop bits
        expected[5] = 2; // even parity
        expected[6] = 7;
        assert_eq!(set.data, expected);
    }

    #[test]
    fn hx_reset_writes_both_fifo_registers() {
        let (handle, dev) = open_pl2303(0x03, 0x40);
        let mut driver = probe(&dev, 0).unwrap().unwrap();
        driver.reset().unwrap();
        let controls = handle.controls();
        let tail = &controls[controls.len() - 2..];
        assert_eq!(tail[0].request, RESET_RD_REQ);
        assert_eq!(tail[1].request, RESET_WR_REQ);
    }

    #[test]
    fn legacy_reset_is_a_no_op() {
        let (handle, dev) = open_pl2303(0x00, 0x08);
        let mut driver = probe(&dev, 0).unwrap().unwrap();
        let before = handle.controls().len();
        driver.reset().unwrap();
        assert_eq!(handle.controls().len(), before);
    }

    #[test]
    fn send_break_uses_the_class_request() {
        let (handle, dev) = open_pl2303(0x00, 0x40);
        let mut driver = probe(&dev, 0).unwrap().unwrap();
        driver.send_break().unwrap();
        let last = handle.controls().pop().unwrap();
        assert_eq!((last.request_type, last.request), (BREAK_RQT, BREAK_REQ));
    }
}
