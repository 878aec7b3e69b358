//! Initialised carriers, addressed by opaque handles.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use log::{info, warn};
use spin::RwLock;

use crate::board::{Board, CarrierOps};
use crate::carrier::CarrierInstance;
use crate::error::{IpacError, IpacResult};
use crate::geometry::AddressSpace;
use crate::irq::{IrqCommand, IrqHandler, IrqReply};
use crate::platform::Platform;
use crate::window::Window;

#[cfg(feature = "std")]
use crate::hotswap::{PresenceEvent, PresenceMonitor};

/// Token handed to the module manager for a carrier. Only meaningful to the
/// registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CarrierHandle(u32);

impl fmt::Display for CarrierHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry-wide tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Period of the hotswap presence scan.
    pub presence_interval: Duration,
    /// Upper bound on each blocking wait in a dispatch thread, which is how
    /// quickly it notices a stop request.
    pub dispatch_poll: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            presence_interval: Duration::from_millis(300),
            dispatch_poll: Duration::from_millis(100),
        }
    }
}

pub struct CarrierRegistry {
    platform: Arc<dyn Platform>,
    options: RegistryOptions,
    carriers: RwLock<BTreeMap<CarrierHandle, Arc<CarrierInstance>>>,
    next: AtomicU32,
    #[cfg(feature = "std")]
    presence: spin::Once<PresenceMonitor>,
}

impl CarrierRegistry {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::with_options(platform, RegistryOptions::default())
    }

    pub fn with_options(platform: Arc<dyn Platform>, options: RegistryOptions) -> Self {
        Self {
            platform,
            options,
            carriers: RwLock::new(BTreeMap::new()),
            next: AtomicU32::new(1),
            #[cfg(feature = "std")]
            presence: spin::Once::new(),
        }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Creates a carrier of `board` from `params`. On failure nothing is
    /// published and nothing stays registered.
    pub fn initialise(
        &self,
        board: &'static dyn Board,
        params: &str,
        carrier: u16,
    ) -> IpacResult<CarrierHandle> {
        let instance = CarrierInstance::create(
            board,
            params,
            carrier,
            self.platform.clone(),
            &self.options,
        )
        .inspect_err(|e| warn!("{}: initialise('{}') failed: {}", board.name(), params, e))?;

        let handle = CarrierHandle(self.next.fetch_add(1, Ordering::Relaxed));

        #[cfg(feature = "std")]
        if board.hotswap(instance.config()) {
            let interval = self.options.presence_interval;
            self.presence
                .call_once(|| PresenceMonitor::spawn(interval))
                .watch(handle, instance.core().clone());
        }

        self.carriers.write().insert(handle, Arc::new(instance));
        info!("{}: carrier {} registered as {}", board.name(), carrier, handle);
        Ok(handle)
    }

    /// The carrier behind `handle`. Unknown handles are a bad address.
    pub fn lookup(&self, handle: CarrierHandle) -> IpacResult<Arc<CarrierInstance>> {
        self.carriers
            .read()
            .get(&handle)
            .cloned()
            .ok_or(IpacError::BadAddress)
    }

    /// Removes a carrier and shuts it down.
    pub fn destroy(&self, handle: CarrierHandle) -> IpacResult<()> {
        let instance = self
            .carriers
            .write()
            .remove(&handle)
            .ok_or(IpacError::BadAddress)?;
        #[cfg(feature = "std")]
        if let Some(monitor) = self.presence.get() {
            monitor.unwatch(handle);
        }
        instance.shutdown();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.carriers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<CarrierHandle> {
        self.carriers.read().keys().copied().collect()
    }

    pub fn report(&self, handle: CarrierHandle, slot: u16) -> IpacResult<Option<String>> {
        self.lookup(handle)?.report(slot)
    }

    pub fn base_addr(
        &self,
        handle: CarrierHandle,
        slot: u16,
        space: AddressSpace,
    ) -> IpacResult<Option<Window>> {
        self.lookup(handle)?.base_addr(slot, space)
    }

    pub fn irq_cmd(
        &self,
        handle: CarrierHandle,
        slot: u16,
        line: u16,
        cmd: IrqCommand,
    ) -> IpacResult<IrqReply> {
        self.lookup(handle)?.irq_cmd(slot, line, cmd)
    }

    pub fn int_connect(
        &self,
        handle: CarrierHandle,
        slot: u16,
        vector: u8,
        handler: IrqHandler,
    ) -> IpacResult<()> {
        self.lookup(handle)?.int_connect(slot, vector, handler)
    }

    /// The next hotswap insertion or removal, waiting up to `timeout`.
    #[cfg(feature = "std")]
    pub fn next_presence_event(&self, timeout: Option<Duration>) -> Option<PresenceEvent> {
        self.presence.get()?.next_event(timeout)
    }
}

impl Drop for CarrierRegistry {
    fn drop(&mut self) {
        for (_, instance) in core::mem::take(&mut *self.carriers.write()) {
            instance.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SimPlatform;

    #[test]
    fn unknown_handle_is_bad_address() {
        let registry = CarrierRegistry::new(SimPlatform::new());
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(CarrierHandle(7)).err(), Some(IpacError::BadAddress));
        assert_eq!(registry.destroy(CarrierHandle(7)), Err(IpacError::BadAddress));
        assert_eq!(
            registry.irq_cmd(CarrierHandle(7), 0, 0, IrqCommand::GetLevel),
            Err(IpacError::BadAddress)
        );
    }
}
