use core::fmt;

use crate::consts::*;
use crate::window::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// Original IndustryPack layout, "IPAC" one character per word.
    Ipac,
    /// VITA 4 layout, "VITA4 " two characters per word, 24-bit manufacturer.
    Vita4,
}

/// Identity read from a module's ID PROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleId {
    pub format: IdFormat,
    pub manufacturer: u32,
    pub model: u16,
    pub revision: u16,
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Manufacturer {:#08x}, Model {:#06x}, Rev {:#x}",
            self.manufacturer, self.model, self.revision
        )
    }
}

fn word(id: &Window, index: usize) -> Option<u16> {
    id.read16(2 * index).ok()
}

fn byte(id: &Window, index: usize) -> Option<u8> {
    word(id, index).map(|w| (w & 0xff) as u8)
}

/// Reads the module identity from an ID space window.
///
/// Returns `None` when nothing answers or neither signature matches, which
/// is how an empty slot looks.
pub fn read_id(id: &Window) -> Option<ModuleId> {
    let ipac = (0..4).all(|i| byte(id, i) == Some(ID_IPAC_SIGNATURE[i]));
    if ipac {
        return Some(ModuleId {
            format: IdFormat::Ipac,
            manufacturer: byte(id, ID_IPAC_MANUFACTURER_WORD)? as u32,
            model: byte(id, ID_IPAC_MODEL_WORD)? as u16,
            revision: byte(id, ID_IPAC_REVISION_WORD)? as u16,
        });
    }

    let vita4 = (0..3).all(|i| word(id, i) == Some(ID_VITA4_SIGNATURE[i]));
    if vita4 {
        let (high, low) = ID_VITA4_MANUFACTURER_WORDS;
        return Some(ModuleId {
            format: IdFormat::Vita4,
            manufacturer: ((word(id, high)? as u32) << 16) | word(id, low)? as u32,
            model: word(id, ID_VITA4_MODEL_WORD)?,
            revision: word(id, ID_VITA4_REVISION_WORD)?,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{BusSpace, Platform, SimPlatform, WindowRequest};
    use axaddrspace::device::AccessWidth;

    fn id_window(sim: &SimPlatform, words: &[u16]) -> Window {
        let mem = sim.attach(BusSpace::VmeA16, 0x80, 0x80);
        mem.load_words(0, words);
        let req = WindowRequest::new(BusSpace::VmeA16, 0x80, 0x80, AccessWidth::Word);
        Window::new(sim.map(&req).unwrap(), req.base)
    }

    #[test]
    fn ipac_signature() {
        let sim = SimPlatform::new();
        let id = id_window(&sim, &[0x49, 0x50, 0x41, 0x43, 0xf0, 0x41, 0x0b]);
        let module = read_id(&id).unwrap();
        assert_eq!(module.format, IdFormat::Ipac);
        assert_eq!((module.manufacturer, module.model, module.revision), (0xf0, 0x41, 0x0b));
    }

    #[test]
    fn vita4_signature() {
        let sim = SimPlatform::new();
        let id = id_window(&sim, &[0x5649, 0x5441, 0x3420, 0x0080, 0x0300, 0x8505, 0x0002]);
        let module = read_id(&id).unwrap();
        assert_eq!(module.format, IdFormat::Vita4);
        assert_eq!(module.manufacturer, 0x0080_0300);
        assert_eq!(module.model, 0x8505);
    }

    #[test]
    fn empty_or_absent_slot() {
        let sim = SimPlatform::new();
        let id = id_window(&sim, &[]);
        assert_eq!(read_id(&id), None);
        sim.memory(BusSpace::VmeA16, 0x80).unwrap().0.set_present(false);
        assert_eq!(read_id(&id), None);
    }
}
