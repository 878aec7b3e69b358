//! Typed access to mapped carrier and module address windows.

use alloc::sync::Arc;
use core::fmt;

use axaddrspace::{device::AccessWidth, HostPhysAddr};

use crate::error::{IpacError, IpacResult};
use crate::utils::{check_access, perform_mmio_read, perform_mmio_write};

/// A mapped region of bus address space.
///
/// Offsets are relative to the start of the region. Implementations reject
/// accesses that fall outside `len()`.
pub trait RegisterWindow: Send + Sync {
    fn len(&self) -> usize;

    /// Process-visible address of the first byte.
    fn host_addr(&self) -> usize;

    fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize>;

    fn write(&self, offset: usize, width: AccessWidth, value: usize) -> IpacResult<()>;
}

/// Memory-mapped I/O backed by volatile loads and stores.
pub struct MmioWindow {
    base: usize,
    len: usize,
}

impl MmioWindow {
    /// # Safety
    ///
    /// `base..base + len` must stay mapped for the lifetime of the window.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }
}

impl RegisterWindow for MmioWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn host_addr(&self) -> usize {
        self.base
    }

    fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize> {
        check_access(offset, width, self.len)?;
        // SAFETY: bounds checked above, mapping guaranteed by the constructor.
        Ok(unsafe { perform_mmio_read(self.base + offset, width) })
    }

    fn write(&self, offset: usize, width: AccessWidth, value: usize) -> IpacResult<()> {
        check_access(offset, width, self.len)?;
        // SAFETY: bounds checked above, mapping guaranteed by the constructor.
        unsafe { perform_mmio_write(self.base + offset, width, value) };
        Ok(())
    }
}

/// A slice of a mapped region, as handed out by `base_addr`.
///
/// Cloning is cheap and every clone addresses the same hardware.
#[derive(Clone)]
pub struct Window {
    region: Arc<dyn RegisterWindow>,
    phys: HostPhysAddr,
    offset: usize,
    len: usize,
}

impl Window {
    /// Wraps a whole mapped region whose first byte sits at bus address `phys`.
    pub fn new(region: Arc<dyn RegisterWindow>, phys: HostPhysAddr) -> Self {
        let len = region.len();
        Self {
            region,
            phys,
            offset: 0,
            len,
        }
    }

    /// A sub-window sharing the same mapping.
    pub fn slice(&self, offset: usize, len: usize) -> IpacResult<Window> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(Window {
                region: self.region.clone(),
                phys: HostPhysAddr::from_usize(self.phys.as_usize() + offset),
                offset: self.offset + offset,
                len,
            }),
            _ => Err(IpacError::BadAddress),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bus address of the first byte.
    pub fn phys_addr(&self) -> HostPhysAddr {
        self.phys
    }

    /// Process-visible address of the first byte.
    pub fn as_ptr(&self) -> usize {
        self.region.host_addr() + self.offset
    }

    pub fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize> {
        check_access(offset, width, self.len)?;
        self.region.read(self.offset + offset, width)
    }

    pub fn write(&self, offset: usize, width: AccessWidth, value: usize) -> IpacResult<()> {
        check_access(offset, width, self.len)?;
        self.region.write(self.offset + offset, width, value)
    }

    pub fn read8(&self, offset: usize) -> IpacResult<u8> {
        self.read(offset, AccessWidth::Byte).map(|v| v as u8)
    }

    pub fn read16(&self, offset: usize) -> IpacResult<u16> {
        self.read(offset, AccessWidth::Word).map(|v| v as u16)
    }

    pub fn read32(&self, offset: usize) -> IpacResult<u32> {
        self.read(offset, AccessWidth::Dword).map(|v| v as u32)
    }

    pub fn write8(&self, offset: usize, value: u8) -> IpacResult<()> {
        self.write(offset, AccessWidth::Byte, value as usize)
    }

    pub fn write16(&self, offset: usize, value: u16) -> IpacResult<()> {
        self.write(offset, AccessWidth::Word, value as usize)
    }

    pub fn write32(&self, offset: usize, value: u32) -> IpacResult<()> {
        self.write(offset, AccessWidth::Dword, value as usize)
    }

    /// Read-modify-write of a 16-bit register.
    pub fn modify16(&self, offset: usize, f: impl FnOnce(u16) -> u16) -> IpacResult<()> {
        let value = self.read16(offset)?;
        self.write16(offset, f(value))
    }
}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr() && self.len == other.len && self.phys == other.phys
    }
}

impl Eq for Window {}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("phys", &format_args!("{:#x}", self.phys.as_usize()))
            .field("host", &format_args!("{:#x}", self.as_ptr()))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}
