//! What differs between carrier families, and the entry points every
//! carrier exposes to the module manager.

use alloc::string::String;

use bitmaps::Bitmap;

use crate::config::{CarrierConfig, Grammar};
use crate::consts::MAX_SLOTS;
use crate::error::{IpacError, IpacResult};
use crate::geometry::{AddressSpace, Placement};
use crate::irq::{IrqCommand, IrqHandler, IrqReply};
use crate::platform::EventDevice;
use crate::window::Window;

/// When slot windows get registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Every window at initialisation.
    Eager,
    /// Each window on its first lookup.
    Lazy,
}

/// How interrupts reach the routing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// The bus layer calls `service_vector` from interrupt context.
    BusVectored,
    /// A thread waits for an interrupt count, then scans the pending register.
    EventCount(EventDevice),
    /// A thread reads vectors from the device. It starts with the first
    /// connected handler.
    DeviceVector(EventDevice),
}

/// Software copies of carrier control registers.
///
/// Boards use the fields their hardware has; the rest stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMirror {
    pub control: u16,
    /// Interrupt enables, one bit per (slot, line) as laid out by `Board::irq_bit`.
    pub intsel: Bitmap<16>,
    pub mem_base: u16,
    pub clock: u16,
    pub hotswap: u16,
    pub slot_control: [u16; MAX_SLOTS],
}

impl Default for RegisterMirror {
    fn default() -> Self {
        Self {
            control: 0,
            intsel: Bitmap::new(),
            mem_base: 0,
            clock: 0,
            hotswap: 0,
            slot_control: [0; MAX_SLOTS],
        }
    }
}

/// One carrier family: its parameter grammar, offset tables, register
/// layout and dispatch strategy.
pub trait Board: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn slots(&self) -> u16;

    fn grammar(&self) -> &'static Grammar;

    fn resolution(&self) -> Resolution {
        Resolution::Eager
    }

    /// Cross-field checks the grammar cannot express.
    fn validate(&self, _cfg: &CarrierConfig) -> IpacResult<()> {
        Ok(())
    }

    /// The carrier's own register block.
    fn control(&self, cfg: &CarrierConfig) -> Placement;

    /// A window holding the carrier's identity, when it is not the control block.
    fn identity(&self, _cfg: &CarrierConfig) -> Option<Placement> {
        None
    }

    /// Checks the identity window. `NoModule` when nothing answers,
    /// `BadModule` when something else does.
    fn identify(&self, _id: &Window) -> IpacResult<()> {
        Ok(())
    }

    /// Where `space` of `slot` lives. `Ok(None)` for spaces the slot does not
    /// decode, `Err(Inaccessible)` for the hidden half of a double-wide pair.
    fn resolve(
        &self,
        cfg: &CarrierConfig,
        slot: u16,
        space: AddressSpace,
    ) -> IpacResult<Option<Placement>>;

    fn initial_mirror(&self, cfg: &CarrierConfig) -> RegisterMirror;

    /// Brings freshly mapped hardware into the state `mirror` describes.
    fn program(
        &self,
        ctl: &Window,
        _cfg: &CarrierConfig,
        mirror: &RegisterMirror,
    ) -> IpacResult<()> {
        self.write_mirror(ctl, mirror)
    }

    fn write_mirror(&self, ctl: &Window, mirror: &RegisterMirror) -> IpacResult<()>;

    fn irq_bit(&self, slot: u16, line: u16) -> usize {
        (2 * slot + line) as usize
    }

    /// Inverse of `irq_bit`.
    fn irq_owner(&self, bit: usize) -> Option<(u16, u16)> {
        (0..self.slots())
            .flat_map(|slot| [(slot, 0), (slot, 1)])
            .find(|&(slot, line)| self.irq_bit(slot, line) == bit)
    }

    /// Asserted lines, straight from hardware.
    fn read_pending(&self, ctl: &Window) -> IpacResult<Bitmap<16>>;

    fn set_enabled(&self, mirror: &mut RegisterMirror, slot: u16, line: u16, on: bool) {
        mirror.intsel.set(self.irq_bit(slot, line), on);
    }

    /// The level reported by `GetLevel`.
    fn int_level(&self, cfg: &CarrierConfig) -> u8 {
        cfg.int_level
    }

    fn level_cmd(
        &self,
        _ctl: &Window,
        _mirror: &mut RegisterMirror,
        _level: u8,
    ) -> IpacResult<IrqReply> {
        Err(IpacError::NotImplemented)
    }

    fn clear(
        &self,
        _ctl: &Window,
        _mirror: &mut RegisterMirror,
        _slot: u16,
        _line: u16,
    ) -> IpacResult<IrqReply> {
        Err(IpacError::NotImplemented)
    }

    /// Bus interrupt level to enable at initialisation.
    fn bus_level(&self, _cfg: &CarrierConfig) -> Option<u8> {
        None
    }

    fn dispatch(&self, cfg: &CarrierConfig) -> DispatchStrategy;

    /// Whether the carrier can be removed and reinserted while running.
    fn hotswap(&self, _cfg: &CarrierConfig) -> bool {
        false
    }

    /// True while the carrier answers on the bus.
    fn detect_presence(&self, ctl: &Window) -> bool {
        ctl.read16(0).is_ok()
    }

    /// Stops the carrier raising interrupts. Run at shutdown.
    fn quiesce(&self, ctl: &Window, mirror: &mut RegisterMirror) -> IpacResult<()>;

    /// Board-specific lines appended to a slot report.
    fn report_extra(
        &self,
        _ctl: &Window,
        _cfg: &CarrierConfig,
        _slot: u16,
        _out: &mut String,
    ) -> IpacResult<()> {
        Ok(())
    }

    /// Description of the carrier itself, read from its identity window.
    fn carrier_info(&self, _id: &Window) -> Option<String> {
        None
    }
}

/// The entry points a module manager drives once a carrier is initialised.
pub trait CarrierOps: Send + Sync {
    /// Human-readable state of `slot`, or `None` when no module is fitted.
    fn report(&self, slot: u16) -> IpacResult<Option<String>>;

    /// The window `space` of `slot` decodes, or `None` when it decodes none.
    fn base_addr(&self, slot: u16, space: AddressSpace) -> IpacResult<Option<Window>>;

    fn irq_cmd(&self, slot: u16, line: u16, cmd: IrqCommand) -> IpacResult<IrqReply>;

    /// Routes interrupts raised by `slot` (or arriving on `vector`, for
    /// vectored carriers) to `handler`, replacing any earlier handler.
    fn int_connect(&self, slot: u16, vector: u8, handler: IrqHandler) -> IpacResult<()>;
}
