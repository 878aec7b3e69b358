// Layout shared by every IndustryPack carrier, per ANSI/VITA 4 (IndustryPack).

/// Largest slot count of any supported carrier.
pub const MAX_SLOTS: usize = 6;

/// Interrupt request lines per IP slot (INTREQ0 and INTREQ1).
pub const LINES_PER_SLOT: u16 = 2;

/// Number of vectors an 8-bit interrupt vector can name.
pub const NUM_VECTORS: usize = 256;

// --- Per-slot A16 block ---

/// Default stride between the I/O blocks of adjacent slots.
pub const IP_IO_STRIDE: usize = 0x100;

/// Length of the I/O space visible to a module.
pub const IP_IO_SIZE: usize = 0x80;

/// Offset from a slot's I/O block to its ID space.
pub const IP_ID_OFFSET: usize = 0x80;

/// Length of the ID space (32 words in the IPAC format, 64 in VITA4 format).
pub const IP_ID_SIZE: usize = 0x80;

// --- ID PROM, read as 16-bit words whose low byte carries the data ---

/// IPAC format: the signature "IPAC", one character in the low byte of each word.
pub const ID_IPAC_SIGNATURE: [u8; 4] = *b"IPAC";

/// IPAC format: manufacturer ID word index.
pub const ID_IPAC_MANUFACTURER_WORD: usize = 4;

/// IPAC format: model number word index.
pub const ID_IPAC_MODEL_WORD: usize = 5;

/// IPAC format: revision word index.
pub const ID_IPAC_REVISION_WORD: usize = 6;

/// VITA4 format: the signature is "VITA4 " packed two characters per word.
pub const ID_VITA4_SIGNATURE: [u16; 3] = [0x5649, 0x5441, 0x3420];

/// VITA4 format: high and low halves of the manufacturer ID.
pub const ID_VITA4_MANUFACTURER_WORDS: (usize, usize) = (3, 4);

/// VITA4 format: model number word index.
pub const ID_VITA4_MODEL_WORD: usize = 5;

/// VITA4 format: revision word index.
pub const ID_VITA4_REVISION_WORD: usize = 6;

// --- Memory size classes ---

/// Log2 of the smallest memory window, 1 MB.
pub const MEM_SIZE_SHIFT: u32 = 20;

/// Bits of the memory base register that map to A32 address bits 31..16.
pub const MEM_BASE_SHIFT: u32 = 16;

/// Highest slot number on a VME64x backplane.
pub const VME_MAX_SLOT: u16 = 21;
