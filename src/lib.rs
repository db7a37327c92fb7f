//! Attaching to UBI partitions on raw NAND flash and loading static volumes out of them, the way
//! a boot loader does: strictly read-only, with bounded memory, and tolerant of whatever state an
//! interrupted writer left the flash in.

pub mod nand;
pub mod ubi;
pub mod util;
