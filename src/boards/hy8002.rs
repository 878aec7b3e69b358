//! Hytec VICB8802/8002/8004 VME64x carriers.
//!
//! Each carrier occupies 2 KB of A16 space at `slot << 11`: four 0x100
//! blocks of module IO and ID space, the carrier registers at 0x400 and
//! the VME64x configuration ROM at 0x600. Module memory lives in A32,
//! placed geographically or through the memory base register.

use alloc::format;
use alloc::string::String;
use core::fmt::Write;

use axaddrspace::device::AccessWidth;
use bitmaps::Bitmap;
use log::warn;

use crate::board::{Board, DispatchStrategy, RegisterMirror, Resolution};
use crate::config::{
    Absent, CarrierConfig, ClockRate, Field, Grammar, IrqRelease, OptionKey, OptionSpec,
    OptionValue, Positional, Radix,
};
use crate::error::{IpacError, IpacResult};
use crate::geometry::{self, a16_slot_block, AddressSpace, Addressing, Placement};
use crate::platform::{BusSpace, WindowRequest};
use crate::window::Window;

const SLOTS: u16 = 4;

const BLOCK_SHIFT: usize = 11;
const REGISTERS: usize = 0x400;
const REGISTERS_LEN: usize = 0x100;
const CONFIG_ROM: usize = 0x600;
const CONFIG_ROM_LEN: usize = 0x100;

const REG_IPSTAT: usize = 0x00;
const REG_MEMBASE: usize = 0x04;
const REG_CSR: usize = 0x08;
const REG_INTSEL: usize = 0x0C;
const REG_HOTSWAP: usize = 0x10;

const CSR_INTEN: u16 = 0x0002;
const CSR_LEVEL_SHIFT: u16 = 2;
const CSR_CLKSEL: u16 = 0x0020;
const CSR_MEMMODE: u16 = 0x0040;
const CSR_IPMEM_SHIFT: u16 = 7;
const CSR_INTRELS: u16 = 0x0200;
const CSR_CD32: u16 = 0x4000;
const CSR_AB32: u16 = 0x8000;

/// IPSTAT error bit of slot 0; slot N is shifted left by N.
const IPSTAT_SLOT_ERROR: u16 = 0x100;
const IPSTAT_PENDING: u16 = 0x00FF;

// VME64x configuration ROM, one byte every fourth address.
const CR_VALID_C: usize = 0x1F;
const CR_VALID_R: usize = 0x23;
const CR_MANUFACTURER: [usize; 3] = [0x27, 0x2B, 0x2F];
const CR_MODEL: [usize; 4] = [0x33, 0x37, 0x3B, 0x3F];
const CR_REVISION: usize = 0x43;
const CR_XILINX: [usize; 3] = [0x47, 0x4B, 0x4F];
const CR_SERIAL: [usize; 6] = [0xCB, 0xCF, 0xD3, 0xD7, 0xDB, 0xDF];

const IEEE_MANUFACTURER_HYTEC: u32 = 0x00_8003;
const MODEL_8002: u32 = 0x8002_0000;
const MODEL_8004: u32 = 0x8004_0000;

static GRAMMAR: Grammar = Grammar {
    board: "Hy8002",
    positional: &[
        Positional {
            field: Field::CarrierSlot,
            radix: Radix::Decimal,
            min: 0,
            max: 21,
            sentinels: &[],
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
        Positional {
            field: Field::HotswapVector,
            radix: Radix::Auto,
            min: 0,
            max: 255,
            sentinels: &[],
            absent: Absent::Omit,
        },
    ],
    options: &[
        OptionSpec {
            name: "IPMEM",
            key: OptionKey::MemSize,
            value: OptionValue::OneOf(&[1, 2, 4, 8]),
        },
        OptionSpec {
            name: "IPCLCK",
            key: OptionKey::Clock,
            value: OptionValue::OneOf(&[8, 32]),
        },
        OptionSpec {
            name: "ROAK",
            key: OptionKey::Release,
            value: OptionValue::OneOf(&[0, 1]),
        },
        OptionSpec {
            name: "MEMBASE",
            key: OptionKey::MemBase,
            value: OptionValue::UpTo(Radix::Auto, 0xFFFF),
        },
        OptionSpec {
            name: "MEMOFFS",
            key: OptionKey::MemOffs,
            value: OptionValue::UpTo(Radix::Decimal, u32::MAX as u64),
        },
        OptionSpec {
            name: "AB32",
            key: OptionKey::Ab32,
            value: OptionValue::Flag,
        },
        OptionSpec {
            name: "CD32",
            key: OptionKey::Cd32,
            value: OptionValue::Flag,
        },
    ],
};

pub struct Hy8002;

fn block(cfg: &CarrierConfig) -> usize {
    (cfg.carrier_slot.unwrap_or(0) as usize) << BLOCK_SHIFT
}

/// Reads ROM bytes at `offsets`, most significant first.
fn rom_value(id: &Window, offsets: &[usize]) -> IpacResult<u32> {
    offsets
        .iter()
        .try_fold(0u32, |acc, &o| Ok((acc << 8) | id.read8(o)? as u32))
}

impl Hy8002 {
    /// A32 address of `slot`'s memory. Address zero is never decoded.
    fn mem_base(cfg: &CarrierConfig, slot: u16) -> IpacResult<usize> {
        let base = geometry::memory_base(
            cfg.addressing(),
            cfg.carrier_slot.unwrap_or(0),
            slot,
            cfg.mem_size,
        );
        if base == 0 {
            warn!("Hy8002: slot {} memory would sit at A32 address 0", slot);
            return Err(IpacError::BadAddress);
        }
        Ok(base)
    }

    /// The A32 request backing a double-wide pair whose even slot is `slot`.
    fn wide_request(cfg: &CarrierConfig, slot: u16) -> IpacResult<WindowRequest> {
        let base = Self::mem_base(cfg, slot)?;
        Ok(WindowRequest::new(
            BusSpace::VmeA32,
            base,
            2 * cfg.mem_size.bytes(),
            AccessWidth::Dword,
        ))
    }

    fn csr(mirror: &RegisterMirror) -> u16 {
        if mirror.intsel.is_empty() {
            mirror.control & !CSR_INTEN
        } else {
            mirror.control | CSR_INTEN
        }
    }
}

impl Board for Hy8002 {
    fn name(&self) -> &'static str {
        "Hy8002"
    }

    fn slots(&self) -> u16 {
        SLOTS
    }

    fn grammar(&self) -> &'static Grammar {
        &GRAMMAR
    }

    fn resolution(&self) -> Resolution {
        Resolution::Lazy
    }

    fn validate(&self, cfg: &CarrierConfig) -> IpacResult<()> {
        geometry::check_layout(cfg.addressing(), cfg.carrier_slot.unwrap_or(0), cfg.mem_size)
    }

    fn control(&self, cfg: &CarrierConfig) -> Placement {
        Placement::whole(WindowRequest::new(
            BusSpace::VmeA16,
            block(cfg) + REGISTERS,
            REGISTERS_LEN,
            AccessWidth::Word,
        ))
    }

    fn identity(&self, cfg: &CarrierConfig) -> Option<Placement> {
        Some(Placement::whole(WindowRequest::new(
            BusSpace::VmeA16,
            block(cfg) + CONFIG_ROM,
            CONFIG_ROM_LEN,
            AccessWidth::Byte,
        )))
    }

    fn identify(&self, id: &Window) -> IpacResult<()> {
        let valid = id.read8(CR_VALID_C).map_err(|_| {
            warn!("Hy8002: bus error reading the configuration ROM");
            IpacError::NoModule
        })?;
        if valid != b'C' || id.read8(CR_VALID_R)? != b'R' {
            warn!("Hy8002: configuration ROM not found, check the slot number");
            return Err(IpacError::BadModule);
        }
        let manufacturer = rom_value(id, &CR_MANUFACTURER)?;
        if manufacturer != IEEE_MANUFACTURER_HYTEC {
            warn!(
                "Hy8002: manufacturer ID is {:#x}, expected {:#x}",
                manufacturer, IEEE_MANUFACTURER_HYTEC
            );
            return Err(IpacError::BadModule);
        }
        let model = rom_value(id, &CR_MODEL)?;
        if model != MODEL_8002 && model != MODEL_8004 {
            warn!(
                "Hy8002: board ID is {:#x}, expected {:#x} or {:#x}",
                model, MODEL_8002, MODEL_8004
            );
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
        if cfg.double_wide.hides(slot) {
            return Err(IpacError::Inaccessible);
        }
        let wide = cfg.double_wide.is_wide(slot);
        let size = cfg.mem_size.bytes();
        Ok(match space {
            AddressSpace::Io | AddressSpace::Id => a16_slot_block(
                BusSpace::VmeA16,
                block(cfg) + ((slot as usize) << 8),
                space,
            ),
            AddressSpace::Mem if wide => {
                Some(Placement::within(Self::wide_request(cfg, slot)?, 0, size))
            }
            AddressSpace::Mem => Some(Placement::whole(WindowRequest::new(
                BusSpace::VmeA32,
                Self::mem_base(cfg, slot)?,
                size,
                AccessWidth::Word,
            ))),
            AddressSpace::Mem32 if wide => Some(Placement::whole(Self::wide_request(cfg, slot)?)),
            AddressSpace::Mem32 => None,
        })
    }

    fn initial_mirror(&self, cfg: &CarrierConfig) -> RegisterMirror {
        let mut control = (cfg.int_level as u16) << CSR_LEVEL_SHIFT;
        control |= (cfg.mem_size.shift() as u16) << CSR_IPMEM_SHIFT;
        if cfg.clock == ClockRate::Mhz32 {
            control |= CSR_CLKSEL;
        }
        if let Addressing::Register { .. } = cfg.addressing() {
            control |= CSR_MEMMODE;
        }
        if cfg.release == IrqRelease::Roak {
            control |= CSR_INTRELS;
        }
        if cfg.double_wide.ab {
            control |= CSR_AB32;
        }
        if cfg.double_wide.cd {
            control |= CSR_CD32;
        }
        RegisterMirror {
            control,
            mem_base: cfg.mem_base.unwrap_or(0),
            hotswap: cfg.hotswap_vector.map_or(0, u16::from),
            ..RegisterMirror::default()
        }
    }

    fn write_mirror(&self, ctl: &Window, mirror: &RegisterMirror) -> IpacResult<()> {
        ctl.write16(REG_CSR, Self::csr(mirror))?;
        if mirror.control & CSR_MEMMODE != 0 {
            ctl.write16(REG_MEMBASE, mirror.mem_base)?;
        }
        ctl.write16(REG_HOTSWAP, mirror.hotswap)?;
        ctl.write16(REG_INTSEL, mirror.intsel.into_value())
    }

    fn irq_bit(&self, slot: u16, line: u16) -> usize {
        (4 * line + slot) as usize
    }

    fn read_pending(&self, ctl: &Window) -> IpacResult<Bitmap<16>> {
        Ok(Bitmap::from_value(ctl.read16(REG_IPSTAT)? & IPSTAT_PENDING))
    }

    fn bus_level(&self, cfg: &CarrierConfig) -> Option<u8> {
        Some(cfg.int_level)
    }

    fn dispatch(&self, _cfg: &CarrierConfig) -> DispatchStrategy {
        DispatchStrategy::BusVectored
    }

    fn hotswap(&self, cfg: &CarrierConfig) -> bool {
        cfg.hotswap_vector.is_some()
    }

    fn quiesce(&self, ctl: &Window, mirror: &mut RegisterMirror) -> IpacResult<()> {
        mirror.control &= !CSR_INTEN;
        ctl.modify16(REG_CSR, |csr| csr & !CSR_INTEN)
    }

    fn report_extra(
        &self,
        ctl: &Window,
        cfg: &CarrierConfig,
        slot: u16,
        out: &mut String,
    ) -> IpacResult<()> {
        let ipstat = ctl.read16(REG_IPSTAT)?;
        let _ = write!(out, ", INT level {}", cfg.int_level);
        if ipstat & (IPSTAT_SLOT_ERROR << slot) != 0 {
            out.push_str(", slot error");
        }
        Ok(())
    }

    fn carrier_info(&self, id: &Window) -> Option<String> {
        let manufacturer = rom_value(id, &CR_MANUFACTURER).ok()?;
        let model = rom_value(id, &CR_MODEL).ok()?;
        let revision = id.read8(CR_REVISION).ok()?;
        let xilinx = rom_value(id, &CR_XILINX).ok()?;
        let mut serial = String::new();
        for &o in &CR_SERIAL {
            let _ = write!(serial, "{:02x}", id.read8(o).ok()?);
        }
        Some(format!(
            "Hytec VICB{:04x}: manufacturer {:#08x}, revision {:#04x}, Xilinx {:#08x}, serial {}",
            model >> 16,
            manufacturer,
            revision,
            xilinx,
            serial
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use crate::geometry::MemSize;

    fn cfg(params: &str) -> CarrierConfig {
        let cfg = parse(&GRAMMAR, params).unwrap();
        Hy8002.validate(&cfg).unwrap();
        cfg
    }

    #[test]
    fn control_block_follows_vme_slot() {
        let c = cfg("3,2");
        let ctl = Hy8002.control(&c);
        assert_eq!(ctl.request.base.as_usize(), 0x1c00);
        assert_eq!(ctl.request.space, BusSpace::VmeA16);
        let io = Hy8002.resolve(&c, 2, AddressSpace::Io).unwrap().unwrap();
        assert_eq!(io.request.base.as_usize(), 0x1a00);
        let id = Hy8002.resolve(&c, 2, AddressSpace::Id).unwrap().unwrap();
        assert_eq!(id.request, io.request);
        assert_eq!(id.offset, 0x80);
    }

    #[test]
    fn csr_encodes_options() {
        let c = cfg("3,5,IPMEM=2,IPCLCK=32,ROAK=1,MEMBASE=0x9000,AB32");
        let m = Hy8002.initial_mirror(&c);
        assert_eq!(
            m.control,
            (5 << 2) | CSR_CLKSEL | CSR_MEMMODE | (1 << 7) | CSR_INTRELS | CSR_AB32
        );
        assert_eq!(m.mem_base, 0x9000);
        assert_eq!(c.mem_size, MemSize::Mb2);

        // The status reset bit stays clear whatever is enabled.
        let mut m = m;
        m.intsel = Bitmap::from_value(0xFF);
        assert_eq!(Hy8002::csr(&m) & 0x1, 0);
    }

    #[test]
    fn intsel_layout() {
        assert_eq!(Hy8002.irq_bit(0, 0), 0);
        assert_eq!(Hy8002.irq_bit(3, 0), 3);
        assert_eq!(Hy8002.irq_bit(1, 1), 5);
        assert_eq!(Hy8002.irq_owner(6), Some((2, 1)));
    }

    #[test]
    fn double_wide_memory() {
        let c = cfg("3,2,CD32");
        assert_eq!(Hy8002.resolve(&c, 3, AddressSpace::Io), Err(IpacError::Inaccessible));
        let mem32 = Hy8002.resolve(&c, 2, AddressSpace::Mem32).unwrap().unwrap();
        assert_eq!(mem32.request.base.as_usize(), (3 << 22) | (2 << 20));
        assert_eq!(mem32.len, 2 << 20);
        let mem = Hy8002.resolve(&c, 2, AddressSpace::Mem).unwrap().unwrap();
        assert_eq!(mem.request, mem32.request);
        assert_eq!(mem.len, 1 << 20);
        assert_eq!(Hy8002.resolve(&c, 0, AddressSpace::Mem32), Ok(None));
    }

    #[test]
    fn memory_at_address_zero_is_refused() {
        let c = cfg("0,2");
        assert_eq!(Hy8002.resolve(&c, 0, AddressSpace::Mem), Err(IpacError::BadAddress));
        let mem = Hy8002.resolve(&c, 1, AddressSpace::Mem).unwrap().unwrap();
        assert_eq!(mem.request.base.as_usize(), 1 << 20);
        assert!(Hy8002.resolve(&c, 0, AddressSpace::Io).unwrap().is_some());

        let c = cfg("0,2,AB32");
        assert_eq!(Hy8002.resolve(&c, 0, AddressSpace::Mem32), Err(IpacError::BadAddress));
        let c = cfg("3,2,MEMBASE=0");
        assert_eq!(Hy8002.resolve(&c, 0, AddressSpace::Mem), Err(IpacError::BadAddress));
    }

    #[test]
    fn hotswap_vector_is_optional() {
        assert!(!Hy8002.hotswap(&cfg("3,2")));
        let c = cfg("3,2,0x40");
        assert!(Hy8002.hotswap(&c));
        assert_eq!(Hy8002.initial_mirror(&c).hotswap, 0x40);
    }
}
