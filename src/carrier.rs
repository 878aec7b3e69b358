//! The generic carrier engine behind every board family.

use alloc::collections::BTreeMap;
#[cfg(feature = "std")]
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use spin::Mutex;

use crate::board::{Board, CarrierOps, DispatchStrategy, RegisterMirror, Resolution};
use crate::config::{self, CarrierConfig};
use crate::consts::LINES_PER_SLOT;
use crate::error::{IpacError, IpacResult};
use crate::geometry::{AddressSpace, Placement};
use crate::idprom;
use crate::irq::{
    IrqCommand, IrqCounters, IrqHandler, IrqReply, IrqStats, RoutingTable, VectorTable,
};
use crate::platform::{Platform, WindowRequest};
use crate::registry::RegistryOptions;
use crate::window::{RegisterWindow, Window};

#[cfg(feature = "std")]
use crate::dispatch::DispatchThread;
#[cfg(feature = "std")]
use core::time::Duration;

/// Bus registrations owned by one carrier. Each distinct request is
/// registered once; dropping the set releases all of them, which is also
/// how a failed initialisation rolls back.
struct MapSet {
    platform: Arc<dyn Platform>,
    maps: Vec<(WindowRequest, Arc<dyn RegisterWindow>)>,
}

impl MapSet {
    fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            maps: Vec::new(),
        }
    }

    fn registered(&self, request: &WindowRequest) -> Option<Arc<dyn RegisterWindow>> {
        self.maps
            .iter()
            .find(|(r, _)| r == request)
            .map(|(_, region)| region.clone())
    }

    fn window(&mut self, placement: &Placement) -> IpacResult<Window> {
        let request = placement.request;
        let region = match self.registered(&request) {
            Some(region) => region,
            None => {
                let region = self.platform.map(&request)?;
                debug!(
                    "mapped {:?} {:#x}..{:#x}",
                    request.space,
                    request.base.as_usize(),
                    request.end()
                );
                self.maps.push((request, region.clone()));
                region
            }
        };
        Window::new(region, request.base).slice(placement.offset, placement.len)
    }
}

impl Drop for MapSet {
    fn drop(&mut self) {
        for (request, _) in self.maps.drain(..).rev() {
            self.platform.unmap(&request);
        }
    }
}

/// Bus interrupt hookups made while a carrier is created. Whatever is
/// still held when this drops is undone.
struct Hookups {
    platform: Arc<dyn Platform>,
    level: Option<u8>,
    vector: Option<u8>,
}

impl Hookups {
    fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            level: None,
            vector: None,
        }
    }

    /// Keeps the hookups for the published carrier.
    fn keep(mut self) {
        self.level = None;
        self.vector = None;
    }
}

impl Drop for Hookups {
    fn drop(&mut self) {
        if let Some(vector) = self.vector.take() {
            self.platform.disconnect_vector(vector);
        }
        if let Some(level) = self.level.take() {
            self.platform.disable_bus_level(level);
        }
    }
}

type Entry = Result<Option<Window>, IpacError>;

struct AddressTable {
    maps: MapSet,
    entries: BTreeMap<(u16, AddressSpace), Entry>,
}

/// The part of a carrier the interrupt paths need. Dispatch threads and the
/// presence monitor hold it through an `Arc`.
pub struct IrqCore {
    board: &'static dyn Board,
    config: CarrierConfig,
    ctl: Window,
    mirror: Mutex<RegisterMirror>,
    lines: RoutingTable,
    vectors: VectorTable,
    stats: IrqStats,
    present: AtomicBool,
}

impl IrqCore {
    pub fn board(&self) -> &'static dyn Board {
        self.board
    }

    pub fn stats(&self) -> &IrqStats {
        &self.stats
    }

    pub fn mirror(&self) -> RegisterMirror {
        *self.mirror.lock()
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub(crate) fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    /// Asks the hardware whether the carrier is there.
    pub fn detect_presence(&self) -> bool {
        self.board.detect_presence(&self.ctl)
    }

    /// Rewrites every mirrored register, e.g. after the board was reinserted.
    pub fn flush_mirror(&self) -> IpacResult<()> {
        let mirror = self.mirror.lock();
        self.board.write_mirror(&self.ctl, &mirror)
    }

    /// One pass over the pending register: runs the handler of every line
    /// that is both asserted and enabled, once. Returns the number of such
    /// lines.
    pub fn dispatch_pending(&self) -> IpacResult<usize> {
        let pending = self.board.read_pending(&self.ctl)?;
        let enabled = self.mirror.lock().intsel;
        let asserted = pending & enabled;
        let mut serviced = 0;
        for bit in &asserted {
            if let Some((slot, line)) = self.board.irq_owner(bit) {
                self.stats.invoke(self.lines.handler(slot, line));
                serviced += 1;
            }
        }
        Ok(serviced)
    }

    /// Runs the handler connected to `vector`. Safe to call from interrupt
    /// context: it neither blocks nor allocates.
    pub fn service_vector(&self, vector: u8) -> bool {
        let handler = self.vectors.handler(vector);
        let found = handler.is_some();
        self.stats.invoke(handler);
        found
    }
}

/// A carrier created by a successful `initialise`.
pub struct CarrierInstance {
    carrier: u16,
    core: Arc<IrqCore>,
    identity: Option<Window>,
    table: Mutex<AddressTable>,
    platform: Arc<dyn Platform>,
    #[cfg(feature = "std")]
    thread: Mutex<Option<DispatchThread>>,
    #[cfg(feature = "std")]
    dispatch_poll: Duration,
    shut_down: AtomicBool,
}

impl CarrierInstance {
    /// Parses `params`, registers and programs the carrier. Nothing stays
    /// registered when this fails.
    pub fn create(
        board: &'static dyn Board,
        params: &str,
        carrier: u16,
        platform: Arc<dyn Platform>,
        options: &RegistryOptions,
    ) -> IpacResult<Self> {
        #[cfg(not(feature = "std"))]
        let _ = options;
        let name = board.name();
        let cfg = config::parse(board.grammar(), params)?;
        board.validate(&cfg)?;

        let mut maps = MapSet::new(platform.clone());
        let ctl = maps.window(&board.control(&cfg)).inspect_err(|e| {
            warn!("{}: cannot map carrier registers: {}", name, e);
        })?;
        let identity = match board.identity(&cfg) {
            Some(placement) => Some(maps.window(&placement)?),
            None => None,
        };
        board.identify(identity.as_ref().unwrap_or(&ctl))?;

        let mirror = board.initial_mirror(&cfg);
        board.program(&ctl, &cfg, &mirror)?;
        let mut hookups = Hookups::new(platform.clone());
        if let Some(level) = board.bus_level(&cfg).filter(|&l| l > 0) {
            platform.enable_bus_level(level).map_err(|e| {
                warn!("{}: cannot enable interrupt level {}: {}", name, level, e);
                IpacError::BadIntLevel
            })?;
            hookups.level = Some(level);
        }

        let core = Arc::new(IrqCore {
            board,
            config: cfg,
            ctl,
            mirror: Mutex::new(mirror),
            lines: RoutingTable::new(board.slots()),
            vectors: VectorTable::default(),
            stats: IrqStats::default(),
            present: AtomicBool::new(true),
        });

        if let Some(vector) = cfg.hotswap_vector.filter(|_| board.hotswap(&cfg)) {
            let weak: Weak<IrqCore> = Arc::downgrade(&core);
            core.vectors.connect(
                vector,
                Arc::new(move || {
                    if let Some(core) = weak.upgrade() {
                        core.set_present(false);
                    }
                }),
            );
            platform.connect_vector(vector).inspect_err(|e| {
                warn!("{}: cannot connect hotswap vector {:#x}: {}", name, vector, e);
            })?;
            hookups.vector = Some(vector);
        }

        let instance = Self {
            carrier,
            core,
            identity,
            table: Mutex::new(AddressTable {
                maps,
                entries: BTreeMap::new(),
            }),
            platform,
            #[cfg(feature = "std")]
            thread: Mutex::new(None),
            #[cfg(feature = "std")]
            dispatch_poll: options.dispatch_poll,
            shut_down: AtomicBool::new(false),
        };

        if board.resolution() == Resolution::Eager {
            let mut table = instance.table.lock();
            for slot in 0..board.slots() {
                for space in AddressSpace::ALL {
                    let _ = instance.resolve_into(&mut table, slot, space);
                }
            }
        }

        #[cfg(feature = "std")]
        if let DispatchStrategy::EventCount(_) = board.dispatch(&cfg) {
            instance.start_dispatch()?;
        }

        hookups.keep();
        info!("{}: carrier {} initialised from '{}'", name, carrier, params);
        Ok(instance)
    }

    pub fn board(&self) -> &'static dyn Board {
        self.core.board
    }

    pub fn config(&self) -> &CarrierConfig {
        &self.core.config
    }

    /// The index the module manager gave this carrier.
    pub fn carrier_index(&self) -> u16 {
        self.carrier
    }

    pub fn core(&self) -> &Arc<IrqCore> {
        &self.core
    }

    pub fn counters(&self) -> IrqCounters {
        self.core.stats.snapshot()
    }

    pub fn is_present(&self) -> bool {
        self.core.is_present()
    }

    /// Entry point for the bus layer when `vector` fires.
    pub fn service_vector(&self, vector: u8) -> bool {
        self.core.service_vector(vector)
    }

    /// Runs one dispatch pass over the pending register.
    pub fn dispatch_pending(&self) -> IpacResult<usize> {
        self.core.dispatch_pending()
    }

    /// Routes a single (slot, line) to `handler`.
    pub fn connect_line(&self, slot: u16, line: u16, handler: IrqHandler) -> IpacResult<()> {
        self.core.lines.connect(slot, line, handler)
    }

    /// Identity of the carrier itself, when the board can describe it.
    pub fn carrier_info(&self) -> Option<String> {
        let id = self.identity.as_ref().unwrap_or(&self.core.ctl);
        self.core.board.carrier_info(id)
    }

    /// Runs `f` on the window `space` of `slot` without resolving it for
    /// good. A window not yet registered is mapped for the call only.
    fn inspect<T>(
        &self,
        slot: u16,
        space: AddressSpace,
        f: impl FnOnce(&Window) -> T,
    ) -> IpacResult<Option<T>> {
        let table = self.table.lock();
        if let Some(entry) = table.entries.get(&(slot, space)) {
            return Ok(entry.clone()?.as_ref().map(f));
        }
        let Some(placement) = self.core.board.resolve(&self.core.config, slot, space)? else {
            return Ok(None);
        };
        if let Some(region) = table.maps.registered(&placement.request) {
            let window = Window::new(region, placement.request.base)
                .slice(placement.offset, placement.len)?;
            return Ok(Some(f(&window)));
        }
        let mut scratch = MapSet::new(self.platform.clone());
        let window = scratch.window(&placement)?;
        Ok(Some(f(&window)))
    }

    fn check_slot(&self, slot: u16) -> IpacResult<()> {
        if slot >= self.core.board.slots() {
            return Err(IpacError::BadAddress);
        }
        Ok(())
    }

    fn resolve_into(&self, table: &mut AddressTable, slot: u16, space: AddressSpace) -> Entry {
        if let Some(entry) = table.entries.get(&(slot, space)) {
            return entry.clone();
        }
        let board = self.core.board;
        let entry = match board.resolve(&self.core.config, slot, space) {
            Ok(Some(placement)) => match table.maps.window(&placement) {
                Ok(window) => Ok(Some(window)),
                Err(e) => {
                    warn!(
                        "{}: slot {} {:?} window not registered: {}",
                        board.name(),
                        slot,
                        space,
                        e
                    );
                    Err(e)
                }
            },
            other => other.map(|_| None),
        };
        table.entries.insert((slot, space), entry.clone());
        entry
    }

    /// Stops interrupts and dispatch. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "std")]
        if let Some(mut thread) = self.thread.lock().take() {
            thread.stop();
        }
        let core = &self.core;
        let mut mirror = core.mirror.lock();
        if let Err(e) = core.board.quiesce(&core.ctl, &mut mirror) {
            warn!("{}: could not quiesce carrier {}: {}", core.board.name(), self.carrier, e);
        }
        info!("{}: carrier {} shut down", core.board.name(), self.carrier);
    }

    /// Whether a dispatch thread is serving this carrier.
    #[cfg(feature = "std")]
    pub fn dispatch_running(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|t| t.is_running())
    }

    #[cfg(feature = "std")]
    fn start_dispatch(&self) -> IpacResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let device = match self.core.board.dispatch(&self.core.config) {
            DispatchStrategy::EventCount(device) | DispatchStrategy::DeviceVector(device) => device,
            DispatchStrategy::BusVectored => return Ok(()),
        };
        let source = self.platform.open_events(device).inspect_err(|e| {
            warn!("{}: cannot open {:?}: {}", self.core.board.name(), device, e);
        })?;
        *thread = Some(DispatchThread::spawn(
            format!("{}-irq{}", self.core.board.name(), self.carrier),
            self.core.clone(),
            source,
            self.dispatch_poll,
        )?);
        Ok(())
    }
}

impl Drop for CarrierInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CarrierOps for CarrierInstance {
    fn report(&self, slot: u16) -> IpacResult<Option<String>> {
        self.check_slot(slot)?;
        let Ok(Some(Some(module))) = self.inspect(slot, AddressSpace::Id, idprom::read_id) else {
            return Ok(None);
        };

        let core = &self.core;
        let mirror = core.mirror();
        let mut out = String::new();
        let _ = write!(out, "{}", module);
        for line in 0..LINES_PER_SLOT {
            let enabled = mirror.intsel.get(core.board.irq_bit(slot, line));
            let _ = write!(
                out,
                ", INT{}: {}",
                line,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        core.board.report_extra(&core.ctl, &core.config, slot, &mut out)?;
        let c = core.stats.snapshot();
        let _ = write!(
            out,
            "\n    dispatched {}, unused {}, missed {}, faults {}, errors {}",
            c.dispatched, c.unused, c.missed, c.faults, c.io_errors
        );
        Ok(Some(out))
    }

    fn base_addr(&self, slot: u16, space: AddressSpace) -> IpacResult<Option<Window>> {
        self.check_slot(slot)?;
        let mut table = self.table.lock();
        self.resolve_into(&mut table, slot, space)
    }

    fn irq_cmd(&self, slot: u16, line: u16, cmd: IrqCommand) -> IpacResult<IrqReply> {
        self.check_slot(slot)?;
        if line >= LINES_PER_SLOT {
            return Err(IpacError::BadIntLevel);
        }
        let core = &self.core;
        let board = core.board;
        let bit = board.irq_bit(slot, line);
        match cmd {
            IrqCommand::GetLevel => Ok(IrqReply::Level(board.int_level(&core.config))),
            IrqCommand::Enable | IrqCommand::Disable => {
                let mut mirror = core.mirror.lock();
                board.set_enabled(&mut mirror, slot, line, cmd == IrqCommand::Enable);
                if core.is_present() {
                    board.write_mirror(&core.ctl, &mirror)?;
                }
                Ok(IrqReply::Ok)
            }
            IrqCommand::Poll => {
                let pending = board.read_pending(&core.ctl)?.get(bit);
                let enabled = core.mirror.lock().intsel.get(bit);
                Ok(IrqReply::Status { enabled, pending })
            }
            IrqCommand::Clear => board.clear(&core.ctl, &mut core.mirror.lock(), slot, line),
            IrqCommand::Level(level) if level > 7 => Err(IpacError::BadIntLevel),
            IrqCommand::Level(level) => board.level_cmd(&core.ctl, &mut core.mirror.lock(), level),
            IrqCommand::SetEdge | IrqCommand::SetLevel => Err(IpacError::NotImplemented),
        }
    }

    fn int_connect(&self, slot: u16, vector: u8, handler: IrqHandler) -> IpacResult<()> {
        self.check_slot(slot)?;
        let core = &self.core;
        let strategy = core.board.dispatch(&core.config);
        let hotswap = core.config.hotswap_vector.filter(|_| core.board.hotswap(&core.config));
        // The hotswap vector lives in the same vector table.
        if hotswap == Some(vector) && !matches!(strategy, DispatchStrategy::EventCount(_)) {
            warn!("{}: vector {:#x} is the hotswap vector", core.board.name(), vector);
            return Err(IpacError::BadParam("vector is reserved for hotswap"));
        }
        match strategy {
            DispatchStrategy::BusVectored => {
                core.vectors.connect(vector, handler);
                self.platform.connect_vector(vector)
            }
            DispatchStrategy::EventCount(_) => {
                for line in 0..LINES_PER_SLOT {
                    core.lines.connect(slot, line, handler.clone())?;
                }
                Ok(())
            }
            #[cfg_attr(not(feature = "std"), allow(unused_variables))]
            DispatchStrategy::DeviceVector(device) => {
                core.vectors.connect(vector, handler);
                #[cfg(feature = "std")]
                {
                    self.platform.register_vector(device, vector)?;
                    self.start_dispatch()?;
                }
                Ok(())
            }
        }
    }
}
