//! TEWS TAMC220 PCIe carrier, reached through a UIO device.

use alloc::format;
use alloc::string::String;

use axaddrspace::device::AccessWidth;
use bitmaps::Bitmap;

use crate::board::{Board, DispatchStrategy, RegisterMirror};
use crate::config::{Absent, CarrierConfig, Field, Grammar, Positional, Radix};
use crate::consts::{IP_ID_OFFSET, IP_ID_SIZE, IP_IO_STRIDE};
use crate::error::IpacResult;
use crate::geometry::{shared_slot_block, AddressSpace, Placement};
use crate::platform::{BusSpace, EventDevice, WindowRequest};
use crate::window::Window;

const SLOTS: u16 = 3;

/// Interrupt level reported to modules. The PCIe side has no level to set.
const IRQ_LEVEL: u8 = 6;

const CTL_BAR: u8 = 2;
const CTL_LEN: usize = 0x100;
const IO_BAR: u8 = 3;
const IO_LEN: usize = 0x1000;

const REG_REVISION: usize = 0x00;
const REG_IP_CTL: usize = 0x02;
const REG_IP_RESET: usize = 0x0A;
const REG_IP_STATUS: usize = 0x0C;

const CTL_INT0_EN: u16 = 0x40;
const CTL_INT1_EN: u16 = 0x80;
const STATUS_PENDING: u16 = 0x3F;

static GRAMMAR: Grammar = Grammar {
    board: "Tamc220",
    positional: &[Positional {
        field: Field::UioDevice,
        radix: Radix::Decimal,
        min: 0,
        max: 255,
        sentinels: &[],
        absent: Absent::Required,
    }],
    options: &[],
};

pub struct Tamc220;

fn uio(cfg: &CarrierConfig) -> u32 {
    cfg.uio_device.unwrap_or(0)
}

impl Board for Tamc220 {
    fn name(&self) -> &'static str {
        "Tamc220"
    }

    fn slots(&self) -> u16 {
        SLOTS
    }

    fn grammar(&self) -> &'static Grammar {
        &GRAMMAR
    }

    fn control(&self, cfg: &CarrierConfig) -> Placement {
        Placement::whole(WindowRequest::new(
            BusSpace::UioResource { uio: uio(cfg), bar: CTL_BAR },
            0,
            CTL_LEN,
            AccessWidth::Word,
        ))
    }

    fn resolve(
        &self,
        cfg: &CarrierConfig,
        slot: u16,
        space: AddressSpace,
    ) -> IpacResult<Option<Placement>> {
        let request = WindowRequest::new(
            BusSpace::UioResource { uio: uio(cfg), bar: IO_BAR },
            0,
            IO_LEN,
            AccessWidth::Word,
        );
        let io = IP_IO_STRIDE * slot as usize;
        Ok(shared_slot_block(request, io, io + IP_ID_OFFSET, IP_ID_SIZE, space))
    }

    fn initial_mirror(&self, _cfg: &CarrierConfig) -> RegisterMirror {
        RegisterMirror::default()
    }

    fn program(
        &self,
        ctl: &Window,
        _cfg: &CarrierConfig,
        mirror: &RegisterMirror,
    ) -> IpacResult<()> {
        // Release every slot from reset before enabling anything.
        ctl.write16(REG_IP_RESET, 0)?;
        self.write_mirror(ctl, mirror)
    }

    fn write_mirror(&self, ctl: &Window, mirror: &RegisterMirror) -> IpacResult<()> {
        for slot in 0..SLOTS {
            let mut word = mirror.slot_control[slot as usize] & !(CTL_INT0_EN | CTL_INT1_EN);
            if mirror.intsel.get(self.irq_bit(slot, 0)) {
                word |= CTL_INT0_EN;
            }
            if mirror.intsel.get(self.irq_bit(slot, 1)) {
                word |= CTL_INT1_EN;
            }
            ctl.write16(REG_IP_CTL + 2 * slot as usize, word)?;
        }
        Ok(())
    }

    fn read_pending(&self, ctl: &Window) -> IpacResult<Bitmap<16>> {
        Ok(Bitmap::from_value(ctl.read16(REG_IP_STATUS)? & STATUS_PENDING))
    }

    fn int_level(&self, _cfg: &CarrierConfig) -> u8 {
        IRQ_LEVEL
    }

    fn dispatch(&self, cfg: &CarrierConfig) -> DispatchStrategy {
        DispatchStrategy::EventCount(EventDevice::Uio(uio(cfg)))
    }

    fn quiesce(&self, ctl: &Window, mirror: &mut RegisterMirror) -> IpacResult<()> {
        mirror.intsel = Bitmap::new();
        self.write_mirror(ctl, mirror)
    }

    fn carrier_info(&self, ctl: &Window) -> Option<String> {
        let revision = ctl.read16(REG_REVISION).ok()?;
        Some(format!("TEWS TAMC220, revision {:#06x}", revision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;

    #[test]
    fn windows_live_in_bar3() {
        let cfg = parse(&GRAMMAR, "4").unwrap();
        let id = Tamc220.resolve(&cfg, 1, AddressSpace::Id).unwrap().unwrap();
        assert_eq!(id.request.space, BusSpace::UioResource { uio: 4, bar: 3 });
        assert_eq!(id.offset, 0x180);
        assert_eq!(Tamc220.resolve(&cfg, 1, AddressSpace::Mem), Ok(None));
        assert_eq!(
            Tamc220.dispatch(&cfg),
            DispatchStrategy::EventCount(EventDevice::Uio(4))
        );
        assert!(parse(&GRAMMAR, "").is_err());
    }
}
