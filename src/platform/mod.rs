//! The host facilities a carrier needs: window registration, bus interrupt
//! levels and interrupt event devices.

use alloc::sync::Arc;

use axaddrspace::{device::AccessWidth, HostPhysAddr};

use crate::error::IpacResult;
use crate::window::RegisterWindow;

#[cfg(feature = "std")]
use crate::dispatch::InterruptSource;

#[cfg(feature = "std")]
mod linux;
mod sim;

#[cfg(feature = "std")]
pub use linux::LinuxPlatform;
pub use sim::{SimMemory, SimPlatform};

#[cfg(feature = "std")]
pub use sim::SimEvents;

/// Regions of a Hytec carrier driver device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HytecRegion {
    /// Carrier registers, reached through read/write ioctls.
    Registers,
    /// The mmap'able module memory and I/O space.
    Memory,
    /// Driver configuration; word 0 holds the hardware ID.
    Config,
}

/// Address space a window is registered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BusSpace {
    VmeA16,
    VmeA24,
    VmeA32,
    /// PCI resource `bar` of UIO device `uio`.
    UioResource { uio: u32, bar: u8 },
    /// Hytec carrier device; `None` is the single-carrier node.
    Hytec {
        device: Option<u8>,
        region: HytecRegion,
    },
}

/// A bus window to be registered and mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRequest {
    pub space: BusSpace,
    pub base: HostPhysAddr,
    pub len: usize,
    pub width: AccessWidth,
}

impl WindowRequest {
    pub fn new(space: BusSpace, base: usize, len: usize, width: AccessWidth) -> Self {
        Self {
            space,
            base: HostPhysAddr::from_usize(base),
            len,
            width,
        }
    }

    pub fn end(&self) -> usize {
        self.base.as_usize() + self.len
    }

    pub fn overlaps(&self, other: &WindowRequest) -> bool {
        self.space == other.space
            && self.base.as_usize() < other.end()
            && other.base.as_usize() < self.end()
    }
}

/// Source of interrupt events for a dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventDevice {
    /// `/dev/uioN`: each event is a 32-bit interrupt count.
    Uio(u32),
    /// A Hytec carrier node: each event is an interrupt vector.
    Hytec(Option<u8>),
}

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Registers `request` and returns a process-visible mapping of it.
    /// Overlapping an existing registration is an error.
    fn map(&self, request: &WindowRequest) -> IpacResult<Arc<dyn RegisterWindow>>;

    /// Releases a registration made by `map`.
    fn unmap(&self, request: &WindowRequest);

    /// Enables a bus interrupt request level.
    fn enable_bus_level(&self, _level: u8) -> IpacResult<()> {
        Ok(())
    }

    /// Undoes `enable_bus_level`.
    fn disable_bus_level(&self, _level: u8) {}

    /// Tells the bus layer to deliver `vector` to the carrier's vector table.
    fn connect_vector(&self, _vector: u8) -> IpacResult<()> {
        Ok(())
    }

    /// Undoes `connect_vector`.
    fn disconnect_vector(&self, _vector: u8) {}

    /// Opens the event stream a dispatch thread blocks on.
    #[cfg(feature = "std")]
    fn open_events(
        &self,
        device: EventDevice,
    ) -> IpacResult<alloc::boxed::Box<dyn InterruptSource>>;

    /// Asks a vector-delivering device to forward `vector`.
    #[cfg(feature = "std")]
    fn register_vector(&self, _device: EventDevice, _vector: u8) -> IpacResult<()> {
        Ok(())
    }
}
