#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod consts;
mod utils;

pub mod board;
pub mod boards;
pub mod carrier;
pub mod config;
pub mod error;
pub mod geometry;
pub mod idprom;
pub mod irq;
pub mod platform;
pub mod registry;
pub mod window;

#[cfg(feature = "std")]
pub mod dispatch;
#[cfg(feature = "std")]
pub mod hotswap;
#[cfg(feature = "std")]
pub mod queue;

pub use consts::*;

pub use board::{Board, CarrierOps, DispatchStrategy, RegisterMirror, Resolution};
pub use carrier::{CarrierInstance, IrqCore};
pub use config::{CarrierConfig, ClockRate, IrqRelease};
pub use error::{IpacError, IpacResult};
pub use geometry::{AddressSpace, Addressing, DoubleWide, MemSize};
pub use irq::{IrqCommand, IrqCounters, IrqHandler, IrqReply};
pub use registry::{CarrierHandle, CarrierRegistry, RegistryOptions};
pub use window::{RegisterWindow, Window};
