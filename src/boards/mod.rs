//! The supported carrier families.

mod apcie8650;
mod hy8002;
mod hylinux;
mod tamc220;
mod xy9660;

pub use apcie8650::Apcie8650;
pub use hy8002::Hy8002;
pub use hylinux::{device as hytec_device, HyLinux, SINGLE_CARRIER};
pub use tamc220::Tamc220;
pub use xy9660::Xy9660;

use crate::board::Board;

pub static HY8002: Hy8002 = Hy8002;
pub static XY9660: Xy9660 = Xy9660;
pub static TAMC220: Tamc220 = Tamc220;
pub static APCIE8650: Apcie8650 = Apcie8650;
pub static HY_LINUX: HyLinux = HyLinux;

static ALL: [&dyn Board; 5] = [&HY8002, &XY9660, &TAMC220, &APCIE8650, &HY_LINUX];

/// Every supported board.
pub fn all() -> &'static [&'static dyn Board] {
    &ALL
}

/// Looks a board up by its name, ignoring case.
pub fn by_name(name: &str) -> Option<&'static dyn Board> {
    ALL.iter().copied().find(|b| b.name().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        assert_eq!(by_name("hy8002").map(|b| b.slots()), Some(4));
        assert_eq!(by_name("HyLinux").map(|b| b.slots()), Some(6));
        assert!(by_name("Tip810").is_none());
        assert_eq!(all().len(), 5);
    }
}
