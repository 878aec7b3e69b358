//! A simulated bus, for tests and dry runs without carrier hardware.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use axaddrspace::device::AccessWidth;
use log::debug;
use spin::Mutex;

use super::{BusSpace, Platform, WindowRequest};
use crate::error::{IpacError, IpacResult};
use crate::utils::{check_access, width_bytes};
use crate::window::RegisterWindow;

#[cfg(feature = "std")]
use super::EventDevice;
#[cfg(feature = "std")]
use crate::dispatch::{InterruptSource, IrqEvent};

/// Simulated bus memory. Reads and writes fail with `NoModule` while the
/// region is marked absent, the way a bus error would.
pub struct SimMemory {
    data: Mutex<Box<[u8]>>,
    host: usize,
    present: AtomicBool,
}

impl SimMemory {
    pub fn new(len: usize) -> Arc<Self> {
        let data = vec![0u8; len].into_boxed_slice();
        let host = data.as_ptr() as usize;
        Arc::new(Self {
            data: Mutex::new(data),
            host,
            present: AtomicBool::new(true),
        })
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn access(&self, offset: usize, width: AccessWidth, value: Option<usize>) -> IpacResult<usize> {
        if !self.is_present() {
            return Err(IpacError::NoModule);
        }
        let mut data = self.data.lock();
        check_access(offset, width, data.len())?;
        let bytes = &mut data[offset..offset + width_bytes(width)];
        if let Some(value) = value {
            let raw = (value as u64).to_ne_bytes();
            // to_ne_bytes puts the low byte first only on little endian hosts.
            if cfg!(target_endian = "little") {
                bytes.copy_from_slice(&raw[..bytes.len()]);
            } else {
                bytes.copy_from_slice(&raw[8 - bytes.len()..]);
            }
            return Ok(0);
        }
        let mut raw = [0u8; 8];
        if cfg!(target_endian = "little") {
            raw[..bytes.len()].copy_from_slice(bytes);
        } else {
            raw[8 - bytes.len()..].copy_from_slice(bytes);
        }
        Ok(u64::from_ne_bytes(raw) as usize)
    }

    pub fn peek8(&self, offset: usize) -> u8 {
        self.data.lock().get(offset).copied().unwrap_or(0)
    }

    pub fn peek16(&self, offset: usize) -> u16 {
        let data = self.data.lock();
        match data.get(offset..offset + 2) {
            Some(b) => u16::from_ne_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    pub fn poke8(&self, offset: usize, value: u8) {
        if let Some(b) = self.data.lock().get_mut(offset) {
            *b = value;
        }
    }

    pub fn poke16(&self, offset: usize, value: u16) {
        if let Some(b) = self.data.lock().get_mut(offset..offset + 2) {
            b.copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// Writes a run of 16-bit words starting at `offset`.
    pub fn load_words(&self, offset: usize, words: &[u16]) {
        for (i, word) in words.iter().enumerate() {
            self.poke16(offset + 2 * i, *word);
        }
    }
}

struct SimWindow {
    mem: Arc<SimMemory>,
    offset: usize,
    len: usize,
}

impl RegisterWindow for SimWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn host_addr(&self) -> usize {
        self.mem.host + self.offset
    }

    fn read(&self, offset: usize, width: AccessWidth) -> IpacResult<usize> {
        check_access(offset, width, self.len)?;
        self.mem.access(self.offset + offset, width, None)
    }

    fn write(&self, offset: usize, width: AccessWidth, value: usize) -> IpacResult<()> {
        check_access(offset, width, self.len)?;
        self.mem.access(self.offset + offset, width, Some(value)).map(|_| ())
    }
}

fn remove_one(list: &mut Vec<u8>, value: u8) -> bool {
    match list.iter().position(|&v| v == value) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

struct Backing {
    space: BusSpace,
    base: usize,
    mem: Arc<SimMemory>,
}

/// An in-memory bus for tests and dry runs.
///
/// Memory attached with [`SimPlatform::attach`] backs later mappings; ranges
/// nobody attached read as zero. Registrations follow the same overlap rule
/// a real bus address registry applies.
#[derive(Default)]
pub struct SimPlatform {
    backing: Mutex<Vec<Backing>>,
    registered: Mutex<Vec<WindowRequest>>,
    failing: Mutex<Vec<(BusSpace, usize)>>,
    failing_vectors: Mutex<Vec<u8>>,
    levels: Mutex<Vec<u8>>,
    vectors: Mutex<Vec<u8>>,
    #[cfg(feature = "std")]
    events: Mutex<alloc::collections::BTreeMap<EventDevice, SimEvents>>,
}

impl SimPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backs `len` bytes at `base` in `space` with fresh memory.
    pub fn attach(&self, space: BusSpace, base: usize, len: usize) -> Arc<SimMemory> {
        let mem = SimMemory::new(len);
        self.backing.lock().push(Backing {
            space,
            base,
            mem: mem.clone(),
        });
        mem
    }

    /// The memory backing `addr`, and the offset of `addr` inside it.
    pub fn memory(&self, space: BusSpace, addr: usize) -> Option<(Arc<SimMemory>, usize)> {
        self.backing
            .lock()
            .iter()
            .find(|b| b.space == space && addr >= b.base && addr < b.base + b.mem.len())
            .map(|b| (b.mem.clone(), addr - b.base))
    }

    /// Makes the next mapping that starts at `base` fail.
    pub fn fail_map(&self, space: BusSpace, base: usize) {
        self.failing.lock().push((space, base));
    }

    /// Makes the next connection of `vector` fail.
    pub fn fail_vector(&self, vector: u8) {
        self.failing_vectors.lock().push(vector);
    }

    pub fn registered(&self) -> Vec<WindowRequest> {
        self.registered.lock().clone()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn enabled_levels(&self) -> Vec<u8> {
        self.levels.lock().clone()
    }

    pub fn connected_vectors(&self) -> Vec<u8> {
        self.vectors.lock().clone()
    }

    /// The injection side of `device`'s event stream.
    #[cfg(feature = "std")]
    pub fn events(&self, device: EventDevice) -> SimEvents {
        self.events
            .lock()
            .entry(device)
            .or_insert_with(SimEvents::new)
            .clone()
    }

    fn backing_for(&self, request: &WindowRequest) -> (Arc<SimMemory>, usize) {
        let base = request.base.as_usize();
        let mut backing = self.backing.lock();
        let found = backing.iter().find(|b| {
            b.space == request.space && base >= b.base && request.end() <= b.base + b.mem.len()
        });
        if let Some(b) = found {
            return (b.mem.clone(), base - b.base);
        }
        let mem = SimMemory::new(request.len);
        backing.push(Backing {
            space: request.space,
            base,
            mem: mem.clone(),
        });
        (mem, 0)
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn map(&self, request: &WindowRequest) -> IpacResult<Arc<dyn RegisterWindow>> {
        let base = request.base.as_usize();
        {
            let mut failing = self.failing.lock();
            if let Some(pos) = failing
                .iter()
                .position(|(space, at)| *space == request.space && *at == base)
            {
                failing.remove(pos);
                return Err(IpacError::NoMemory);
            }
        }
        let mut registered = self.registered.lock();
        if registered.iter().any(|r| r.overlaps(request)) {
            debug!("sim: {:?} at {:#x} overlaps a registration", request.space, base);
            return Err(IpacError::NoMemory);
        }
        let (mem, offset) = self.backing_for(request);
        registered.push(*request);
        Ok(Arc::new(SimWindow {
            mem,
            offset,
            len: request.len,
        }))
    }

    fn unmap(&self, request: &WindowRequest) {
        let mut registered = self.registered.lock();
        if let Some(pos) = registered.iter().position(|r| r == request) {
            registered.remove(pos);
        }
    }

    fn enable_bus_level(&self, level: u8) -> IpacResult<()> {
        self.levels.lock().push(level);
        Ok(())
    }

    fn disable_bus_level(&self, level: u8) {
        remove_one(&mut self.levels.lock(), level);
    }

    fn connect_vector(&self, vector: u8) -> IpacResult<()> {
        if remove_one(&mut self.failing_vectors.lock(), vector) {
            return Err(IpacError::BadDriver);
        }
        self.vectors.lock().push(vector);
        Ok(())
    }

    fn disconnect_vector(&self, vector: u8) {
        remove_one(&mut self.vectors.lock(), vector);
    }

    #[cfg(feature = "std")]
    fn open_events(&self, device: EventDevice) -> IpacResult<Box<dyn InterruptSource>> {
        Ok(Box::new(self.events(device).source()?))
    }

    #[cfg(feature = "std")]
    fn register_vector(&self, _device: EventDevice, vector: u8) -> IpacResult<()> {
        self.vectors.lock().push(vector);
        Ok(())
    }
}

#[cfg(feature = "std")]
pub use events::SimEvents;

#[cfg(feature = "std")]
mod events {
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    use super::*;

    /// Injects interrupt events into a simulated event device.
    #[derive(Clone)]
    pub struct SimEvents {
        inner: Arc<Mutex<EventsInner>>,
    }

    struct EventsInner {
        tx: Option<Sender<IrqEvent>>,
        rx: Option<Receiver<IrqEvent>>,
    }

    impl SimEvents {
        pub(super) fn new() -> Self {
            let (tx, rx) = mpsc::channel();
            Self {
                inner: Arc::new(Mutex::new(EventsInner {
                    tx: Some(tx),
                    rx: Some(rx),
                })),
            }
        }

        /// Queues an event. Returns false once the device is closed.
        pub fn send(&self, event: IrqEvent) -> bool {
            match &self.inner.lock().tx {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        }

        /// Closes the device; the reader sees `DeviceGone` after draining.
        pub fn close(&self) {
            self.inner.lock().tx = None;
        }

        pub(super) fn source(&self) -> IpacResult<SimEventSource> {
            match self.inner.lock().rx.take() {
                Some(rx) => Ok(SimEventSource { rx }),
                None => Err(IpacError::BadDriver),
            }
        }
    }

    pub(super) struct SimEventSource {
        rx: Receiver<IrqEvent>,
    }

    impl InterruptSource for SimEventSource {
        fn wait(&mut self, timeout: Duration) -> IpacResult<IrqEvent> {
            match self.rx.recv_timeout(timeout) {
                Ok(event) => Ok(event),
                Err(RecvTimeoutError::Timeout) => Ok(IrqEvent::Idle),
                Err(RecvTimeoutError::Disconnected) => Err(IpacError::DeviceGone),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_attached_memory_and_refuses_overlap() {
        let sim = SimPlatform::new();
        let mem = sim.attach(BusSpace::VmeA16, 0x1800, 0x800);
        mem.poke16(0x408, 0xbeef);

        let regs = WindowRequest::new(BusSpace::VmeA16, 0x1c00, 0x20, AccessWidth::Word);
        let w = sim.map(&regs).unwrap();
        assert_eq!(w.read(0x8, AccessWidth::Word).unwrap(), 0xbeef);
        w.write(0xc, AccessWidth::Word, 0x12).unwrap();
        assert_eq!(mem.peek16(0x40c), 0x12);

        let clash = WindowRequest::new(BusSpace::VmeA16, 0x1c10, 0x20, AccessWidth::Word);
        assert_eq!(sim.map(&clash).err(), Some(IpacError::NoMemory));
        sim.unmap(&regs);
        assert_eq!(sim.registered_count(), 0);
        assert!(sim.map(&clash).is_ok());
    }

    #[test]
    fn absent_memory_faults() {
        let sim = SimPlatform::new();
        let mem = sim.attach(BusSpace::VmeA32, 0, 0x100);
        let w = sim
            .map(&WindowRequest::new(BusSpace::VmeA32, 0, 0x100, AccessWidth::Word))
            .unwrap();
        mem.set_present(false);
        assert_eq!(w.read(0, AccessWidth::Word), Err(IpacError::NoModule));
        mem.set_present(true);
        assert_eq!(w.read(0, AccessWidth::Word), Ok(0));
    }

    #[test]
    fn injected_failure_fires_once() {
        let sim = SimPlatform::new();
        let req = WindowRequest::new(BusSpace::VmeA24, 0x40000, 0x100, AccessWidth::Word);
        sim.fail_map(BusSpace::VmeA24, 0x40000);
        assert_eq!(sim.map(&req).err(), Some(IpacError::NoMemory));
        assert!(sim.map(&req).is_ok());
    }
}
