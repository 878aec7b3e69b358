//! Acromag APCe8650 PCIe carrier, reached through a UIO device.
//!
//! Everything sits in one 64 MB BAR: the carrier registers, ID and IO
//! space of every slot, then an 8 MB memory window per slot.

use axaddrspace::device::AccessWidth;
use bitmaps::Bitmap;

use crate::board::{Board, DispatchStrategy, RegisterMirror};
use crate::config::{
    Absent, CarrierConfig, ClockRate, Field, Grammar, OptionKey, OptionSpec, OptionValue,
    Positional, Radix,
};
use crate::consts::IP_IO_SIZE;
use crate::error::{IpacError, IpacResult};
use crate::geometry::{AddressSpace, Placement};
use crate::irq::IrqReply;
use crate::platform::{BusSpace, EventDevice, WindowRequest};
use crate::window::Window;

const SLOTS: u16 = 4;

/// Interrupt level reported to modules. The PCIe side has no level to set.
const IRQ_LEVEL: u8 = 6;

const BAR: u8 = 2;
const BAR_LEN: usize = 64 << 20;
const REGISTERS_LEN: usize = 0x40;

const ID_STRIDE: usize = 0x40;
const IO_BASE: usize = 0x180;
const IO_STRIDE: usize = 0x80;
const MEM_STRIDE: usize = 0x80_0000;

const REG_STS_CTL: usize = 0x00;
const REG_INT_PENDING: usize = 0x02;
const REG_INT_SELECT: usize = 0x04;
const REG_CLK_CTL: usize = 0x18;

const STS_GLOBAL_EN: u16 = 0x04;
/// 32 MHz for every slot.
const CLK_ALL_32MHZ: u16 = 0x0F;

static GRAMMAR: Grammar = Grammar {
    board: "Apcie8650",
    positional: &[Positional {
        field: Field::UioDevice,
        radix: Radix::Decimal,
        min: 0,
        max: 255,
        sentinels: &[],
        absent: Absent::Required,
    }],
    options: &[OptionSpec {
        name: "IPCLCK",
        key: OptionKey::Clock,
        value: OptionValue::OneOf(&[8, 32]),
    }],
};

pub struct Apcie8650;

fn bar(cfg: &CarrierConfig) -> WindowRequest {
    WindowRequest::new(
        BusSpace::UioResource {
            uio: cfg.uio_device.unwrap_or(0),
            bar: BAR,
        },
        0,
        BAR_LEN,
        AccessWidth::Word,
    )
}

impl Board for Apcie8650 {
    fn name(&self) -> &'static str {
        "Apcie8650"
    }

    fn slots(&self) -> u16 {
        SLOTS
    }

    fn grammar(&self) -> &'static Grammar {
        &GRAMMAR
    }

    fn control(&self, cfg: &CarrierConfig) -> Placement {
        Placement::within(bar(cfg), 0, REGISTERS_LEN)
    }

    fn resolve(
        &self,
        cfg: &CarrierConfig,
        slot: u16,
        space: AddressSpace,
    ) -> IpacResult<Option<Placement>> {
        let slot = slot as usize;
        let request = bar(cfg);
        Ok(match space {
            AddressSpace::Io => Some(Placement::within(
                request,
                IO_BASE + IO_STRIDE * slot,
                IP_IO_SIZE,
            )),
            AddressSpace::Id => Some(Placement::within(request, ID_STRIDE * (slot + 1), ID_STRIDE)),
            AddressSpace::Mem => Some(Placement::within(
                request,
                MEM_STRIDE * (slot + 1),
                MEM_STRIDE,
            )),
            AddressSpace::Mem32 => None,
        })
    }

    fn initial_mirror(&self, cfg: &CarrierConfig) -> RegisterMirror {
        RegisterMirror {
            clock: if cfg.clock == ClockRate::Mhz32 { CLK_ALL_32MHZ } else { 0 },
            ..RegisterMirror::default()
        }
    }

    fn write_mirror(&self, ctl: &Window, mirror: &RegisterMirror) -> IpacResult<()> {
        ctl.write16(REG_CLK_CTL, mirror.clock)?;
        let enable = !mirror.intsel.is_empty();
        ctl.modify16(REG_STS_CTL, |sts| {
            if enable {
                sts | STS_GLOBAL_EN
            } else {
                sts & !STS_GLOBAL_EN
            }
        })
    }

    fn read_pending(&self, ctl: &Window) -> IpacResult<Bitmap<16>> {
        Ok(Bitmap::from_value(ctl.read16(REG_INT_PENDING)? & 0xFF))
    }

    fn int_level(&self, _cfg: &CarrierConfig) -> u8 {
        IRQ_LEVEL
    }

    /// Levels 0 and 6 are accepted and ignored; the level is fixed.
    fn level_cmd(
        &self,
        _ctl: &Window,
        _mirror: &mut RegisterMirror,
        level: u8,
    ) -> IpacResult<IrqReply> {
        match level {
            0 | IRQ_LEVEL => Ok(IrqReply::Ok),
            _ => Err(IpacError::NotImplemented),
        }
    }

    /// Reading the select word runs the acknowledge cycle.
    fn clear(
        &self,
        ctl: &Window,
        _mirror: &mut RegisterMirror,
        slot: u16,
        line: u16,
    ) -> IpacResult<IrqReply> {
        ctl.read16(REG_INT_SELECT + 2 * self.irq_bit(slot, line))?;
        Ok(IrqReply::Ok)
    }

    fn dispatch(&self, cfg: &CarrierConfig) -> DispatchStrategy {
        DispatchStrategy::EventCount(EventDevice::Uio(cfg.uio_device.unwrap_or(0)))
    }

    fn quiesce(&self, ctl: &Window, mirror: &mut RegisterMirror) -> IpacResult<()> {
        mirror.intsel = Bitmap::new();
        ctl.modify16(REG_STS_CTL, |sts| sts & !STS_GLOBAL_EN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;

    #[test]
    fn every_window_shares_the_bar() {
        let cfg = parse(&GRAMMAR, "1,IPCLCK=32").unwrap();
        let ctl = Apcie8650.control(&cfg);
        for slot in 0..SLOTS {
            for space in [AddressSpace::Io, AddressSpace::Id, AddressSpace::Mem] {
                let p = Apcie8650.resolve(&cfg, slot, space).unwrap().unwrap();
                assert_eq!(p.request, ctl.request);
                assert!(p.offset + p.len <= BAR_LEN);
            }
        }
        let id = Apcie8650.resolve(&cfg, 0, AddressSpace::Id).unwrap().unwrap();
        assert_eq!((id.offset, id.len), (0x40, 0x40));
        let io = Apcie8650.resolve(&cfg, 3, AddressSpace::Io).unwrap().unwrap();
        assert_eq!(io.offset, 0x300);
        assert_eq!(Apcie8650.initial_mirror(&cfg).clock, CLK_ALL_32MHZ);
    }

    #[test]
    fn fixed_interrupt_level() {
        let cfg = parse(&GRAMMAR, "0").unwrap();
        assert_eq!(Apcie8650.int_level(&cfg), 6);
    }
}
