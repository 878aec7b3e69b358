//! XVME-9660 VME carrier, A16 only.

use alloc::string::String;
use core::fmt::Write;

use axaddrspace::device::AccessWidth;
use bitmaps::Bitmap;
use log::warn;

use crate::board::{Board, DispatchStrategy, RegisterMirror};
use crate::config::{Absent, CarrierConfig, Field, Grammar, Positional, Radix};
use crate::consts::IP_IO_STRIDE;
use crate::error::{IpacError, IpacResult};
use crate::geometry::{shared_slot_block, AddressSpace, Placement};
use crate::irq::IrqReply;
use crate::platform::{BusSpace, WindowRequest};
use crate::window::Window;

const SLOTS: u16 = 4;
const EXTENT: usize = 0x400;
const ID_LEN: usize = 0x40;

/// The only level the board interrupts on.
const IRQ_LEVEL: u8 = 6;

const REG_STS: usize = 0xC1;
const REG_LEV: usize = 0xC3;
const REG_ERR: usize = 0xC5;
const REG_MEM_EN: usize = 0xC7;
const REG_MBASR: usize = 0xD1;
const REG_EN: usize = 0xE1;
const REG_PND: usize = 0xE3;
const REG_CLR: usize = 0xE5;

const STS_GLOBAL_PEND: u8 = 0x04;
const STS_GLOBAL_EN: u8 = 0x08;
const STS_SOFT_RESET: u8 = 0x10;

/// Status reads to wait for a soft reset to finish.
const RESET_POLLS: usize = 1000;

static GRAMMAR: Grammar = Grammar {
    board: "Xy9660",
    positional: &[Positional {
        field: Field::IoBase,
        radix: Radix::Hex,
        min: 0,
        max: 0xFC00,
        sentinels: &[],
        absent: Absent::Default(0),
    }],
    options: &[],
};

pub struct Xy9660;

fn registers(cfg: &CarrierConfig) -> WindowRequest {
    WindowRequest::new(
        BusSpace::VmeA16,
        cfg.io_base.unwrap_or(0) as usize,
        EXTENT,
        AccessWidth::Byte,
    )
}

impl Board for Xy9660 {
    fn name(&self) -> &'static str {
        "Xy9660"
    }

    fn slots(&self) -> u16 {
        SLOTS
    }

    fn grammar(&self) -> &'static Grammar {
        &GRAMMAR
    }

    fn validate(&self, cfg: &CarrierConfig) -> IpacResult<()> {
        if cfg.io_base.unwrap_or(0) as usize % EXTENT != 0 {
            return Err(IpacError::BadParam("base address must be a multiple of 0x400"));
        }
        Ok(())
    }

    fn control(&self, cfg: &CarrierConfig) -> Placement {
        Placement::whole(registers(cfg))
    }

    fn resolve(
        &self,
        cfg: &CarrierConfig,
        slot: u16,
        space: AddressSpace,
    ) -> IpacResult<Option<Placement>> {
        let io = IP_IO_STRIDE * slot as usize;
        Ok(shared_slot_block(registers(cfg), io, io + 0x80, ID_LEN, space))
    }

    fn initial_mirror(&self, _cfg: &CarrierConfig) -> RegisterMirror {
        RegisterMirror {
            control: STS_GLOBAL_EN as u16,
            intsel: Bitmap::from_value(0x00FF),
            ..RegisterMirror::default()
        }
    }

    fn program(
        &self,
        ctl: &Window,
        _cfg: &CarrierConfig,
        mirror: &RegisterMirror,
    ) -> IpacResult<()> {
        ctl.write8(REG_STS, STS_SOFT_RESET)?;
        let mut polls = 0;
        while ctl.read8(REG_STS)? & STS_SOFT_RESET != 0 {
            polls += 1;
            if polls == RESET_POLLS {
                warn!("Xy9660: soft reset did not clear, continuing");
                break;
            }
            core::hint::spin_loop();
        }
        ctl.write8(REG_LEV, IRQ_LEVEL)?;
        ctl.write8(REG_CLR, 0xFF)?;
        self.write_mirror(ctl, mirror)
    }

    fn write_mirror(&self, ctl: &Window, mirror: &RegisterMirror) -> IpacResult<()> {
        ctl.write8(REG_EN, mirror.intsel.into_value() as u8)?;
        ctl.write8(REG_STS, mirror.control as u8 & STS_GLOBAL_EN)
    }

    fn read_pending(&self, ctl: &Window) -> IpacResult<Bitmap<16>> {
        Ok(Bitmap::from_value(ctl.read8(REG_PND)? as u16))
    }

    fn int_level(&self, _cfg: &CarrierConfig) -> u8 {
        IRQ_LEVEL
    }

    fn level_cmd(
        &self,
        ctl: &Window,
        mirror: &mut RegisterMirror,
        level: u8,
    ) -> IpacResult<IrqReply> {
        match level {
            0 => {
                mirror.control &= !(STS_GLOBAL_EN as u16);
                ctl.write8(REG_STS, 0)?;
                ctl.write8(REG_CLR, 0xFF)?;
            }
            IRQ_LEVEL => {
                mirror.control |= STS_GLOBAL_EN as u16;
                ctl.write8(REG_STS, STS_GLOBAL_EN)?;
            }
            _ => return Err(IpacError::NotImplemented),
        }
        Ok(IrqReply::Ok)
    }

    fn clear(
        &self,
        ctl: &Window,
        mirror: &mut RegisterMirror,
        slot: u16,
        line: u16,
    ) -> IpacResult<IrqReply> {
        ctl.write8(REG_CLR, 1 << self.irq_bit(slot, line))?;
        ctl.write8(REG_EN, mirror.intsel.into_value() as u8)?;
        Ok(IrqReply::Ok)
    }

    fn bus_level(&self, _cfg: &CarrierConfig) -> Option<u8> {
        Some(IRQ_LEVEL)
    }

    fn dispatch(&self, _cfg: &CarrierConfig) -> DispatchStrategy {
        DispatchStrategy::BusVectored
    }

    fn detect_presence(&self, ctl: &Window) -> bool {
        ctl.read8(REG_STS).is_ok()
    }

    fn quiesce(&self, ctl: &Window, mirror: &mut RegisterMirror) -> IpacResult<()> {
        mirror.control &= !(STS_GLOBAL_EN as u16);
        ctl.write8(REG_STS, 0)
    }

    fn report_extra(
        &self,
        ctl: &Window,
        _cfg: &CarrierConfig,
        slot: u16,
        out: &mut String,
    ) -> IpacResult<()> {
        // Carrier-wide registers, shown once.
        if slot != 0 {
            return Ok(());
        }
        let sts = ctl.read8(REG_STS)?;
        let _ = write!(
            out,
            concat!(
                "\n    STS {:#04x}{}, LEV {:#04x}, ERR {:#04x},",
                " MEM_EN {:#04x}, EN {:#04x}, PND {:#04x}"
            ),
            sts,
            if sts & STS_GLOBAL_PEND != 0 { " (pending)" } else { "" },
            ctl.read8(REG_LEV)?,
            ctl.read8(REG_ERR)?,
            ctl.read8(REG_MEM_EN)?,
            ctl.read8(REG_EN)?,
            ctl.read8(REG_PND)?,
        );
        out.push_str("\n    MBASR");
        for i in 0..SLOTS as usize {
            let _ = write!(out, " {:#04x}", ctl.read8(REG_MBASR + 2 * i)?);
        }
        Ok(())
    }
}
