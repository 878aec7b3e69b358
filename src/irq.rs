//! Interrupt commands, routing tables and dispatch counters.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "std")]
use log::error;
use spin::RwLock;

use crate::consts::{LINES_PER_SLOT, NUM_VECTORS};
use crate::error::{IpacError, IpacResult};

/// A slot-level interrupt handler. State it needs is captured by the closure.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Commands accepted by `irq_cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqCommand {
    /// Select bus interrupt level 0..=7. Most carriers fix the level at
    /// initialisation and reject this.
    Level(u8),
    GetLevel,
    Enable,
    Disable,
    /// Read whether the line is asserted, straight from hardware.
    Poll,
    SetEdge,
    SetLevel,
    /// Acknowledge a pending request.
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReply {
    Ok,
    Level(u8),
    Status { enabled: bool, pending: bool },
}

/// Handlers keyed by (slot, line).
///
/// An entry is replaced under its write lock; the dispatcher clones the
/// handler under the read lock and calls it after releasing the lock, so it
/// sees either the old handler or the new one.
pub struct RoutingTable {
    slots: u16,
    entries: Vec<RwLock<Option<IrqHandler>>>,
}

impl RoutingTable {
    pub fn new(slots: u16) -> Self {
        let entries = (0..slots * LINES_PER_SLOT).map(|_| RwLock::new(None)).collect();
        Self { slots, entries }
    }

    fn index(&self, slot: u16, line: u16) -> IpacResult<usize> {
        if slot >= self.slots {
            return Err(IpacError::BadAddress);
        }
        if line >= LINES_PER_SLOT {
            return Err(IpacError::BadIntLevel);
        }
        Ok((slot * LINES_PER_SLOT + line) as usize)
    }

    /// Installs `handler`, replacing any previous one.
    pub fn connect(&self, slot: u16, line: u16, handler: IrqHandler) -> IpacResult<()> {
        let index = self.index(slot, line)?;
        *self.entries[index].write() = Some(handler);
        Ok(())
    }

    pub fn handler(&self, slot: u16, line: u16) -> Option<IrqHandler> {
        let index = self.index(slot, line).ok()?;
        self.entries[index].read().clone()
    }

    pub fn is_connected(&self, slot: u16, line: u16) -> bool {
        self.handler(slot, line).is_some()
    }
}

/// Handlers keyed by interrupt vector.
pub struct VectorTable {
    entries: Vec<RwLock<Option<IrqHandler>>>,
}

impl Default for VectorTable {
    fn default() -> Self {
        Self {
            entries: (0..NUM_VECTORS).map(|_| RwLock::new(None)).collect(),
        }
    }
}

impl VectorTable {
    pub fn connect(&self, vector: u8, handler: IrqHandler) {
        *self.entries[vector as usize].write() = Some(handler);
    }

    pub fn handler(&self, vector: u8) -> Option<IrqHandler> {
        self.entries[vector as usize].read().clone()
    }
}

/// Per-carrier dispatch counters, updated from interrupt context.
#[derive(Default)]
pub struct IrqStats {
    dispatched: AtomicU64,
    unused: AtomicU64,
    missed: AtomicU64,
    faults: AtomicU64,
    io_errors: AtomicU64,
}

/// A snapshot of [`IrqStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqCounters {
    /// Handlers run.
    pub dispatched: u64,
    /// Asserted, enabled lines with no handler, and vectors nobody claimed.
    pub unused: u64,
    /// Interrupts the event count skipped over.
    pub missed: u64,
    /// Handlers that panicked.
    pub faults: u64,
    pub io_errors: u64,
}

impl IrqStats {
    pub fn snapshot(&self) -> IrqCounters {
        IrqCounters {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unused: self.unused.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_missed(&self, n: u64) {
        self.missed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_unused(&self) {
        self.unused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs `handler`, or counts the interrupt as unused.
    ///
    /// With `std`, a panicking handler is caught here and counted so that it
    /// never unwinds into the dispatch loop.
    pub fn invoke(&self, handler: Option<IrqHandler>) {
        let Some(handler) = handler else {
            self.add_unused();
            return;
        };
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "std")]
        {
            let call = std::panic::AssertUnwindSafe(|| handler());
            if std::panic::catch_unwind(call).is_err() {
                self.faults.fetch_add(1, Ordering::Relaxed);
                error!("interrupt handler panicked");
            }
        }
        #[cfg(not(feature = "std"))]
        handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn routing_overwrites() {
        let table = RoutingTable::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        table.connect(2, 1, Arc::new(move || { h1.fetch_add(1, Ordering::SeqCst); })).unwrap();
        let h2 = hits.clone();
        table.connect(2, 1, Arc::new(move || { h2.fetch_add(10, Ordering::SeqCst); })).unwrap();

        let stats = IrqStats::default();
        stats.invoke(table.handler(2, 1));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(stats.snapshot().dispatched, 1);
    }

    #[test]
    fn rejects_bad_slot_and_line() {
        let table = RoutingTable::new(3);
        let noop: IrqHandler = Arc::new(|| {});
        assert_eq!(table.connect(3, 0, noop.clone()), Err(IpacError::BadAddress));
        assert_eq!(table.connect(0, 2, noop), Err(IpacError::BadIntLevel));
        assert!(!table.is_connected(0, 0));
    }

    #[test]
    fn missing_handler_counts_unused() {
        let stats = IrqStats::default();
        stats.invoke(None);
        let c = stats.snapshot();
        assert_eq!((c.unused, c.dispatched), (1, 0));
    }

    #[cfg(feature = "std")]
    #[test]
    fn panicking_handler_is_contained() {
        let stats = IrqStats::default();
        stats.invoke(Some(Arc::new(|| panic!("handler fault"))));
        stats.invoke(Some(Arc::new(|| {})));
        let c = stats.snapshot();
        assert_eq!(c.faults, 1);
        assert_eq!(c.dispatched, 2);
    }

    #[test]
    fn vector_table() {
        let table = VectorTable::default();
        assert!(table.handler(0x41).is_none());
        table.connect(0x41, Arc::new(|| {}));
        assert!(table.handler(0x41).is_some());
        assert!(table.handler(0x42).is_none());
    }
}
