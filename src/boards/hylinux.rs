//! Hytec IOC9010 family carriers behind the Hytec Linux driver.
//!
//! The driver exposes one device node per carrier. Carrier registers are
//! reached through ioctls, module space through an mmap of the node.

use alloc::format;
use alloc::string::String;
use core::fmt::Write;

use axaddrspace::device::AccessWidth;
use bitmaps::Bitmap;
use log::warn;

use crate::board::{Board, DispatchStrategy, RegisterMirror};
use crate::config::{
    Absent, CarrierConfig, ClockRate, Field, Grammar, OptionKey, OptionSpec, OptionValue,
    Positional, Radix,
};
use crate::consts::{IP_ID_OFFSET, IP_ID_SIZE, IP_IO_STRIDE};
use crate::error::{IpacError, IpacResult};
use crate::geometry::{shared_slot_block, AddressSpace, Placement};
use crate::platform::{BusSpace, EventDevice, HytecRegion, WindowRequest};
use crate::window::Window;

const SLOTS: u16 = 6;

/// Carrier number that selects the single-carrier device node.
pub const SINGLE_CARRIER: u16 = 99;

const REGISTERS_LEN: usize = 0x20;
const MEMORY_LEN: usize = 0xE0_0E00;
const MEM_STRIDE: usize = 0x20_0000;
const IO_BASE: usize = 0xE0_0000;

const REG_IP_INT: usize = 0x08;
const REG_IP_INT_MASK: usize = 0x0C;
const REG_IP_CLOCK: usize = 0x10;

const PENDING_MASK: u16 = 0x0FFF;

const HARDWARE_IDS: [u16; 4] = [0x9010, 0x7002, 0x7003, 0x6335];

static GRAMMAR: Grammar = Grammar {
    board: "HyLinux",
    positional: &[
        Positional {
            field: Field::CarrierSlot,
            radix: Radix::Decimal,
            min: 0,
            max: 21,
            sentinels: &[SINGLE_CARRIER as u64],
            absent: Absent::Required,
        },
        Positional {
            field: Field::IntLevel,
            radix: Radix::Decimal,
            min: 0,
            max: 7,
            sentinels: &[],
            absent: Absent::Required,
        },
    ],
    options: &[
        OptionSpec {
            name: "IPCLCKA",
            key: OptionKey::SlotClock(0),
            value: OptionValue::OneOf(&[8, 32]),
        },
        OptionSpec {
            name: "IPCLCKB",
            key: OptionKey::SlotClock(1),
            value: OptionValue::OneOf(&[8, 32]),
        },
        OptionSpec {
            name: "IPCLCKC",
            key: OptionKey::SlotClock(2),
            value: OptionValue::OneOf(&[8, 32]),
        },
        OptionSpec {
            name: "IPCLCKD",
            key: OptionKey::SlotClock(3),
            value: OptionValue::OneOf(&[8, 32]),
        },
        OptionSpec {
            name: "IPCLCKE",
            key: OptionKey::SlotClock(4),
            value: OptionValue::OneOf(&[8, 32]),
        },
        OptionSpec {
            name: "IPCLCKF",
            key: OptionKey::SlotClock(5),
            value: OptionValue::OneOf(&[8, 32]),
        },
    ],
};

pub struct HyLinux;

/// The device node index: `None` for `/dev/IOC9010`, `Some(n)` for `/dev/IOC9010n`.
pub fn device(cfg: &CarrierConfig) -> Option<u8> {
    match cfg.carrier_slot {
        None | Some(SINGLE_CARRIER) => None,
        Some(n) => Some(n as u8),
    }
}

fn region(cfg: &CarrierConfig, region: HytecRegion, len: usize) -> WindowRequest {
    WindowRequest::new(
        BusSpace::Hytec {
            device: device(cfg),
            region,
        },
        0,
        len,
        AccessWidth::Word,
    )
}

impl Board for HyLinux {
    fn name(&self) -> &'static str {
        "HyLinux"
    }

    fn slots(&self) -> u16 {
        SLOTS
    }

    fn grammar(&self) -> &'static Grammar {
        &GRAMMAR
    }

    fn control(&self, cfg: &CarrierConfig) -> Placement {
        Placement::whole(region(cfg, HytecRegion::Registers, REGISTERS_LEN))
    }

    fn identity(&self, cfg: &CarrierConfig) -> Option<Placement> {
        Some(Placement::whole(region(cfg, HytecRegion::Config, 2)))
    }

    fn identify(&self, id: &Window) -> IpacResult<()> {
        let hardware = id.read16(0).map_err(|e| {
            warn!("HyLinux: cannot read the carrier configuration: {}", e);
            IpacError::NoModule
        })?;
        if !HARDWARE_IDS.contains(&hardware) {
            warn!("HyLinux: unknown hardware ID {:#06x}", hardware);
            return Err(IpacError::BadModule);
        }
        Ok(())
    }

    fn resolve(
        &self,
        cfg: &CarrierConfig,
        slot: u16,
        space: AddressSpace,
    ) -> IpacResult<Option<Placement>> {
        let request = region(cfg, HytecRegion::Memory, MEMORY_LEN);
        let slot = slot as usize;
        Ok(match space {
            AddressSpace::Mem => Some(Placement::within(request, MEM_STRIDE * slot, MEM_STRIDE)),
            AddressSpace::Mem32 => None,
            _ => {
                let io = IO_BASE + IP_IO_STRIDE * slot;
                shared_slot_block(request, io, io + IP_ID_OFFSET, IP_ID_SIZE, space)
            }
        })
    }

    fn initial_mirror(&self, cfg: &CarrierConfig) -> RegisterMirror {
        let clock = (0..SLOTS as usize)
            .filter(|&slot| cfg.clock_of(slot) == ClockRate::Mhz32)
            .fold(0u16, |bits, slot| bits | 1 << slot);
        RegisterMirror {
            clock,
            ..RegisterMirror::default()
        }
    }

    fn write_mirror(&self, ctl: &Window, mirror: &RegisterMirror) -> IpacResult<()> {
        ctl.write16(REG_IP_CLOCK, mirror.clock)?;
        ctl.write16(REG_IP_INT_MASK, mirror.intsel.into_value())
    }

    fn read_pending(&self, ctl: &Window) -> IpacResult<Bitmap<16>> {
        Ok(Bitmap::from_value(ctl.read16(REG_IP_INT)? & PENDING_MASK))
    }

    fn dispatch(&self, cfg: &CarrierConfig) -> DispatchStrategy {
        DispatchStrategy::DeviceVector(EventDevice::Hytec(device(cfg)))
    }

    fn quiesce(&self, ctl: &Window, mirror: &mut RegisterMirror) -> IpacResult<()> {
        mirror.intsel = Bitmap::new();
        ctl.write16(REG_IP_INT_MASK, 0)
    }

    fn report_extra(
        &self,
        _ctl: &Window,
        cfg: &CarrierConfig,
        slot: u16,
        out: &mut String,
    ) -> IpacResult<()> {
        let _ = write!(out, ", IP clock {} MHz", cfg.clock_of(slot as usize).mhz());
        Ok(())
    }

    fn carrier_info(&self, id: &Window) -> Option<String> {
        let hardware = id.read16(0).ok()?;
        Some(format!("Hytec {:04x} carrier, hardware ID {:#06x}", hardware, hardware))
    }
}
