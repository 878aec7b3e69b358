//! Address geometry shared by all carrier families.
//!
//! Everything here is a pure function of validated configuration. Boards
//! combine these formulas with their own offset tables in `Board::resolve`.

use axaddrspace::device::AccessWidth;

use crate::consts::*;
use crate::error::{IpacError, IpacResult};
use crate::platform::{BusSpace, WindowRequest};

/// The address spaces an IP module decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressSpace {
    /// I/O space, 64 words.
    Io,
    /// ID PROM space.
    Id,
    /// 16-bit memory space.
    Mem,
    /// 32-bit memory space of a double-wide module.
    Mem32,
}

impl AddressSpace {
    pub const ALL: [AddressSpace; 4] = [
        AddressSpace::Io,
        AddressSpace::Id,
        AddressSpace::Mem,
        AddressSpace::Mem32,
    ];
}

/// Memory window per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemSize {
    #[default]
    Mb1,
    Mb2,
    Mb4,
    Mb8,
}

impl MemSize {
    pub fn from_mb(mb: u64) -> Option<Self> {
        match mb {
            1 => Some(MemSize::Mb1),
            2 => Some(MemSize::Mb2),
            4 => Some(MemSize::Mb4),
            8 => Some(MemSize::Mb8),
            _ => None,
        }
    }

    /// log2 of the size in megabytes.
    pub fn shift(self) -> u32 {
        match self {
            MemSize::Mb1 => 0,
            MemSize::Mb2 => 1,
            MemSize::Mb4 => 2,
            MemSize::Mb8 => 3,
        }
    }

    pub fn bytes(self) -> usize {
        1 << (MEM_SIZE_SHIFT + self.shift())
    }

    pub fn mb(self) -> u32 {
        1 << self.shift()
    }
}

/// How the memory windows of a carrier are placed in A32 space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Addressing {
    /// Derived from the VME64x slot the carrier sits in.
    #[default]
    Geographic,
    /// Derived from a memory base register holding A32 address bits 31..16.
    Register { base: u16 },
}

/// Double-wide module pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DoubleWide {
    /// Slots A and B host one 32-bit module.
    pub ab: bool,
    /// Slots C and D host one 32-bit module.
    pub cd: bool,
}

impl DoubleWide {
    /// True for the odd partner of an enabled pair.
    pub fn hides(&self, slot: u16) -> bool {
        (self.ab && slot == 1) || (self.cd && slot == 3)
    }

    /// True for the even slot that carries an enabled pair.
    pub fn is_wide(&self, slot: u16) -> bool {
        (self.ab && slot == 0) || (self.cd && slot == 2)
    }
}

/// Highest carrier slot geographic addressing can reach with `size`.
///
/// The carrier slot occupies A32 bits 31..(22+k), so bigger modules leave
/// fewer bits for it.
pub fn max_geographic_slot(size: MemSize) -> u16 {
    let limit = (1u16 << (5 - size.shift())) - 1;
    limit.min(VME_MAX_SLOT)
}

/// `(S << (22 + k)) | (I << (20 + k))`
pub fn geographic_base(carrier_slot: u16, ip_slot: u16, size: MemSize) -> usize {
    let k = size.shift();
    ((carrier_slot as usize) << (22 + k)) | ((ip_slot as usize) << (MEM_SIZE_SHIFT + k))
}

/// `(base << 16) | (I << (20 + k))`
pub fn register_base(mem_base: u16, ip_slot: u16, size: MemSize) -> usize {
    ((mem_base as usize) << MEM_BASE_SHIFT)
        | ((ip_slot as usize) << (MEM_SIZE_SHIFT + size.shift()))
}

/// Memory base register value covering four slots of `size`, in 64 KB units.
pub fn mem_base_span(size: MemSize) -> u32 {
    64 << size.shift()
}

/// Checks that memory windows for every slot fit A32 space.
pub fn check_layout(addressing: Addressing, carrier_slot: u16, size: MemSize) -> IpacResult<()> {
    match addressing {
        Addressing::Geographic => {
            if carrier_slot > max_geographic_slot(size) {
                return Err(IpacError::BadParam(
                    "carrier slot out of range for geographic addressing at this memory size",
                ));
            }
        }
        Addressing::Register { base } => {
            let span = mem_base_span(size);
            if base as u32 % span != 0 {
                return Err(IpacError::BadParam("MEMBASE is not aligned to the memory size"));
            }
            if base as u32 + span > 0x1_0000 {
                return Err(IpacError::BadParam("MEMBASE places memory beyond A32 space"));
            }
        }
    }
    Ok(())
}

/// A32 base of `ip_slot`'s memory window.
pub fn memory_base(
    addressing: Addressing,
    carrier_slot: u16,
    ip_slot: u16,
    size: MemSize,
) -> usize {
    match addressing {
        Addressing::Geographic => geographic_base(carrier_slot, ip_slot, size),
        Addressing::Register { base } => register_base(base, ip_slot, size),
    }
}

/// Where a slot's window lives: the registration that backs it and the
/// slice of that registration the slot sees.
///
/// Several placements may share one request; the engine registers each
/// distinct request once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub request: WindowRequest,
    pub offset: usize,
    pub len: usize,
}

impl Placement {
    pub fn whole(request: WindowRequest) -> Self {
        Self {
            request,
            offset: 0,
            len: request.len,
        }
    }

    pub fn within(request: WindowRequest, offset: usize, len: usize) -> Self {
        Self {
            request,
            offset,
            len,
        }
    }
}

/// IO or ID placement inside a per-slot block of `IP_IO_STRIDE` bytes,
/// registered separately for each slot.
pub fn a16_slot_block(
    space: BusSpace,
    block_base: usize,
    which: AddressSpace,
) -> Option<Placement> {
    let request = WindowRequest::new(space, block_base, IP_IO_STRIDE, AccessWidth::Word);
    match which {
        AddressSpace::Io => Some(Placement::within(request, 0, IP_IO_SIZE)),
        AddressSpace::Id => Some(Placement::within(request, IP_ID_OFFSET, IP_ID_SIZE)),
        _ => None,
    }
}

/// IO or ID placement inside a block shared by every slot.
pub fn shared_slot_block(
    request: WindowRequest,
    io_offset: usize,
    id_offset: usize,
    id_len: usize,
    which: AddressSpace,
) -> Option<Placement> {
    match which {
        AddressSpace::Io => Some(Placement::within(request, io_offset, IP_IO_SIZE)),
        AddressSpace::Id => Some(Placement::within(request, id_offset, id_len)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geographic_formula() {
        assert_eq!(geographic_base(3, 0, MemSize::Mb1), 3 << 22);
        assert_eq!(geographic_base(3, 2, MemSize::Mb1), (3 << 22) | (2 << 20));
        assert_eq!(geographic_base(5, 1, MemSize::Mb2), (5 << 23) | (1 << 21));
        assert_eq!(geographic_base(2, 3, MemSize::Mb8), (2 << 25) | (3 << 23));
    }

    #[test]
    fn slot_limits_shrink_with_size() {
        assert_eq!(max_geographic_slot(MemSize::Mb1), 21);
        assert_eq!(max_geographic_slot(MemSize::Mb2), 15);
        assert_eq!(max_geographic_slot(MemSize::Mb4), 7);
        assert_eq!(max_geographic_slot(MemSize::Mb8), 3);
    }

    #[test]
    fn register_layout_checks() {
        assert!(check_layout(Addressing::Register { base: 0x9000 }, 0, MemSize::Mb2).is_ok());
        assert_eq!(register_base(0x9000, 1, MemSize::Mb2), 0x9020_0000);
        assert!(check_layout(Addressing::Register { base: 0x9040 }, 0, MemSize::Mb2).is_err());
        assert!(check_layout(Addressing::Register { base: 0xffc0 }, 0, MemSize::Mb1).is_ok());
        assert!(check_layout(Addressing::Register { base: 0xff80 }, 0, MemSize::Mb4).is_err());
    }

    #[test]
    fn double_wide_partners() {
        let dw = DoubleWide { ab: true, cd: false };
        assert!(dw.hides(1));
        assert!(!dw.hides(3));
        assert!(dw.is_wide(0));
        assert!(!dw.is_wide(2));
    }
}
