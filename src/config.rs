//! Carrier parameter strings.
//!
//! A parameter string is a list of tokens separated by commas and/or
//! whitespace: positional numbers first, then `NAME=value` options and bare
//! flags in any order. Each board describes its own grammar as data; the
//! parser is shared.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::consts::MAX_SLOTS;
use crate::error::{IpacError, IpacResult};
use crate::geometry::{Addressing, DoubleWide, MemSize};
use crate::utils::{parse_auto, parse_dec, parse_hex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Radix {
    Decimal,
    /// `0x` prefix selects hex, otherwise decimal.
    Auto,
    /// Hex with an optional `0x` prefix.
    Hex,
}

impl Radix {
    fn parse(self, text: &str) -> Option<u64> {
        match self {
            Radix::Decimal => parse_dec(text),
            Radix::Auto => parse_auto(text),
            Radix::Hex => parse_hex(text),
        }
    }
}

/// Destination of a positional field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Backplane slot, or carrier number for Hytec devices.
    CarrierSlot,
    IntLevel,
    HotswapVector,
    /// A16 base address of the carrier registers.
    IoBase,
    UioDevice,
}

pub struct Positional {
    pub field: Field,
    pub radix: Radix,
    pub min: u64,
    pub max: u64,
    /// Values accepted outside `min..=max`.
    pub sentinels: &'static [u64],
    pub absent: Absent,
}

/// What a missing positional field means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absent {
    Required,
    Default(u64),
    /// Leave the field unset.
    Omit,
}

/// Destination of a named option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    MemSize,
    Clock,
    SlotClock(u8),
    Release,
    MemBase,
    MemOffs,
    Ab32,
    Cd32,
}

pub enum OptionValue {
    /// Bare word, no value.
    Flag,
    OneOf(&'static [u64]),
    /// Inclusive upper bound.
    UpTo(Radix, u64),
}

pub struct OptionSpec {
    pub name: &'static str,
    pub key: OptionKey,
    pub value: OptionValue,
}

/// The parameter syntax of one board family.
pub struct Grammar {
    pub board: &'static str,
    pub positional: &'static [Positional],
    pub options: &'static [OptionSpec],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockRate {
    #[default]
    Mhz8,
    Mhz32,
}

impl ClockRate {
    fn from_mhz(mhz: u64) -> Option<Self> {
        match mhz {
            8 => Some(ClockRate::Mhz8),
            32 => Some(ClockRate::Mhz32),
            _ => None,
        }
    }

    pub fn mhz(self) -> u32 {
        match self {
            ClockRate::Mhz8 => 8,
            ClockRate::Mhz32 => 32,
        }
    }
}

/// When the carrier considers an interrupt request withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqRelease {
    /// Release on register access.
    #[default]
    Rora,
    /// Release on acknowledge.
    Roak,
}

/// A validated carrier configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CarrierConfig {
    pub carrier_slot: Option<u16>,
    pub int_level: u8,
    pub hotswap_vector: Option<u8>,
    pub io_base: Option<u16>,
    pub uio_device: Option<u32>,
    pub mem_size: MemSize,
    /// Memory base register value, A32 bits 31..16.
    pub mem_base: Option<u16>,
    pub clock: ClockRate,
    /// Per-slot clock overrides.
    pub slot_clock: [Option<ClockRate>; MAX_SLOTS],
    pub double_wide: DoubleWide,
    pub release: IrqRelease,
}

impl CarrierConfig {
    pub fn addressing(&self) -> Addressing {
        match self.mem_base {
            Some(base) => Addressing::Register { base },
            None => Addressing::Geographic,
        }
    }

    /// Clock of `slot`, falling back to the carrier-wide selection.
    pub fn clock_of(&self, slot: usize) -> ClockRate {
        self.slot_clock.get(slot).copied().flatten().unwrap_or(self.clock)
    }
}

/// The legacy MEMOFFS option counts 4 MB blocks scaled by the memory size.
const MEMOFFS_LIMIT: u64 = 1 << 17;

fn is_flag(grammar: &Grammar, token: &str) -> Option<&'static OptionSpec> {
    grammar
        .options
        .iter()
        .find(|o| matches!(o.value, OptionValue::Flag) && o.name == token)
}

/// Parses `params` against `grammar`.
pub fn parse(grammar: &Grammar, params: &str) -> IpacResult<CarrierConfig> {
    let board = grammar.board;
    let mut cfg = CarrierConfig::default();
    let mut seen: Vec<OptionKey> = Vec::new();
    let mut positionals = 0;
    let mut mem_offs = None;

    for token in params
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None if is_flag(grammar, token).is_some() => (token, None),
            None => {
                if !seen.is_empty() {
                    warn!("{}: positional '{}' after options", board, token);
                    return Err(IpacError::BadParam("positional field after options"));
                }
                let Some(spec) = grammar.positional.get(positionals) else {
                    warn!("{}: unexpected field '{}'", board, token);
                    return Err(IpacError::BadParam("too many fields"));
                };
                let value = spec
                    .radix
                    .parse(token)
                    .filter(|v| (spec.min..=spec.max).contains(v) || spec.sentinels.contains(v))
                    .ok_or_else(|| {
                        warn!("{}: {:?} '{}' out of range", board, spec.field, token);
                        IpacError::BadParam("positional field out of range")
                    })?;
                store_field(&mut cfg, spec.field, value);
                positionals += 1;
                continue;
            }
        };

        let Some(spec) = grammar.options.iter().find(|o| o.name == name) else {
            warn!("{}: unknown option '{}'", board, name);
            return Err(IpacError::BadParam("unknown option"));
        };
        if seen.contains(&spec.key) {
            warn!("{}: option '{}' given twice", board, name);
            return Err(IpacError::BadParam("option given twice"));
        }
        let number = match (&spec.value, value) {
            (OptionValue::Flag, None) => 0,
            (OptionValue::Flag, Some(_)) => {
                return Err(IpacError::BadParam("flag option takes no value"));
            }
            (_, None) => return Err(IpacError::BadParam("option needs a value")),
            (OptionValue::OneOf(allowed), Some(text)) => parse_dec(text)
                .filter(|v| allowed.contains(v))
                .ok_or_else(|| {
                    warn!("{}: {}={} not one of {:?}", board, name, text, allowed);
                    IpacError::BadParam("option value not allowed")
                })?,
            (OptionValue::UpTo(radix, max), Some(text)) => radix
                .parse(text)
                .filter(|v| v <= max)
                .ok_or_else(|| {
                    warn!("{}: {}={} out of range", board, name, text);
                    IpacError::BadParam("option value out of range")
                })?,
        };
        seen.push(spec.key);

        match spec.key {
            OptionKey::MemSize => {
                cfg.mem_size = MemSize::from_mb(number).ok_or(IpacError::BadParam("bad IPMEM"))?
            }
            OptionKey::Clock => {
                cfg.clock = ClockRate::from_mhz(number).ok_or(IpacError::BadParam("bad IPCLCK"))?
            }
            OptionKey::SlotClock(slot) => {
                cfg.slot_clock[slot as usize] =
                    Some(ClockRate::from_mhz(number).ok_or(IpacError::BadParam("bad IPCLCK"))?)
            }
            OptionKey::Release => {
                cfg.release = if number == 1 {
                    IrqRelease::Roak
                } else {
                    IrqRelease::Rora
                }
            }
            OptionKey::MemBase => cfg.mem_base = Some(number as u16),
            OptionKey::MemOffs => mem_offs = Some(number),
            OptionKey::Ab32 => cfg.double_wide.ab = true,
            OptionKey::Cd32 => cfg.double_wide.cd = true,
        }
    }

    for spec in &grammar.positional[positionals.min(grammar.positional.len())..] {
        match spec.absent {
            Absent::Default(value) => store_field(&mut cfg, spec.field, value),
            Absent::Omit => {}
            Absent::Required => {
                warn!("{}: missing {:?} in '{}'", board, spec.field, params);
                return Err(IpacError::BadParam("missing required field"));
            }
        }
    }

    if let Some(offs) = mem_offs {
        if seen.contains(&OptionKey::MemBase) {
            return Err(IpacError::BadParam("MEMBASE and MEMOFFS are exclusive"));
        }
        if offs >= MEMOFFS_LIMIT {
            return Err(IpacError::BadParam("MEMOFFS out of range"));
        }
        let base = (offs & !0x3f) << cfg.mem_size.shift();
        cfg.mem_base = Some(
            u16::try_from(base).map_err(|_| IpacError::BadParam("MEMOFFS out of range"))?,
        );
    }

    debug!("{}: parsed '{}' as {:?}", board, params, cfg);
    Ok(cfg)
}

fn store_field(cfg: &mut CarrierConfig, field: Field, value: u64) {
    match field {
        Field::CarrierSlot => cfg.carrier_slot = Some(value as u16),
        Field::IntLevel => cfg.int_level = value as u8,
        Field::HotswapVector => cfg.hotswap_vector = Some(value as u8),
        Field::IoBase => cfg.io_base = Some(value as u16),
        Field::UioDevice => cfg.uio_device = Some(value as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GRAMMAR: Grammar = Grammar {
        board: "test",
        positional: &[
            Positional {
                field: Field::CarrierSlot,
                radix: Radix::Decimal,
                min: 0,
                max: 21,
                sentinels: &[99],
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
                name: "MEMBASE",
                key: OptionKey::MemBase,
                value: OptionValue::UpTo(Radix::Auto, 0xffff),
            },
            OptionSpec {
                name: "MEMOFFS",
                key: OptionKey::MemOffs,
                value: OptionValue::UpTo(Radix::Decimal, u64::MAX),
            },
            OptionSpec {
                name: "AB32",
                key: OptionKey::Ab32,
                value: OptionValue::Flag,
            },
        ],
    };

    static OPTIONAL_TAIL: Grammar = Grammar {
        board: "tail",
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
                absent: Absent::Default(0),
            },
        ],
        options: &[],
    };

    #[test]
    fn mixed_separators() {
        let cfg = parse(&GRAMMAR, "3, 2 17 IPMEM=2,AB32").unwrap();
        assert_eq!(cfg.carrier_slot, Some(3));
        assert_eq!(cfg.int_level, 2);
        assert_eq!(cfg.hotswap_vector, Some(17));
        assert_eq!(cfg.mem_size, MemSize::Mb2);
        assert!(cfg.double_wide.ab);
    }

    #[test]
    fn sentinel_accepted() {
        assert_eq!(parse(&GRAMMAR, "99,1,0").unwrap().carrier_slot, Some(99));
        assert!(parse(&GRAMMAR, "98,1,0").is_err());
    }

    #[test]
    fn omitted_positional_stays_unset() {
        let cfg = parse(&GRAMMAR, "3,2,IPMEM=4").unwrap();
        assert_eq!(cfg.hotswap_vector, None);
        assert_eq!(cfg.mem_size, MemSize::Mb4);
        assert!(parse(&GRAMMAR, "3").is_err());
    }

    #[test]
    fn fails_closed() {
        assert!(parse(&GRAMMAR, "3,2,0,IPMEM=2,IPMEM=2").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,AB32=1").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,IPMEM").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,ipmem=2").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,IPMEM=2,5").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,1").is_err());
        assert!(parse(&GRAMMAR, "3,8,0").is_err());
    }

    #[test]
    fn memoffs_normalises_to_membase() {
        let cfg = parse(&GRAMMAR, "3,2,0,IPMEM=2,MEMOFFS=18496").unwrap();
        assert_eq!(cfg.mem_base, Some(0x9080));
        assert_eq!(cfg.addressing(), Addressing::Register { base: 0x9080 });
        assert!(parse(&GRAMMAR, "3,2,0,MEMOFFS=64,MEMBASE=64").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,IPMEM=2,MEMOFFS=65536").is_err());
        // Decimal only, unlike MEMBASE.
        assert!(parse(&GRAMMAR, "3,2,0,MEMOFFS=0x40").is_err());
        assert!(parse(&GRAMMAR, "3,2,0,MEMBASE=0x40").is_ok());
    }

    #[test]
    fn defaults_fill_optional_positionals() {
        let cfg = parse(&OPTIONAL_TAIL, "4").unwrap();
        assert_eq!(cfg.carrier_slot, Some(4));
        assert_eq!(cfg.int_level, 0);
        assert_eq!(cfg.clock, ClockRate::Mhz8);
        assert_eq!(cfg.mem_size, MemSize::Mb1);
        assert!(parse(&OPTIONAL_TAIL, "").is_err());
    }
}
