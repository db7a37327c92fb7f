//! This module implements attaching to a UBI partition at boot time and loading static volumes out
//! of it, without ever writing to the flash.
//!
//! UBI populates the first writable page of every PEB with an "erase counter" ("EC") header, and
//! if the PEB is in use, a "volume ID" ("VID") header naming the volume and LEB it holds, plus a
//! sequence number that orders competing copies of the same LEB:
//!
//! ```text
//! +- PEB n --------------------------------------------+
//! | EC header | VID header | LEB data ...              |
//! +----------------------------------------------------+
//! 0           vid_offset   leb_start            peb_size
//! ```
//!
//! Attaching rebuilds the LEB-to-PEB tables of the (statically bounded set of) volumes we care
//! about. That is done either by reading the VID header of every PEB, or by trusting a "fastmap"
//! snapshot that UBI periodically writes near the start of the flash, verifying every PEB it names
//! and rescanning only the pools of PEBs it could not keep track of. If anything about the fastmap
//! looks wrong, everything learned from it is thrown away and a full scan is done instead.
//!
//! Loading walks the LEBs of a volume in order, CRC-checking the data of each one. When a mapped
//! PEB turns out to be unusable, the whole flash is searched for the newest replacement copy.

mod attach;
mod error;
mod fastmap;
pub mod headers;
mod load;
mod reader;
mod scan;
pub mod vtbl;

#[cfg(test)]
mod ubinize;

pub use attach::{Geometry, UbiAttach};
pub use error::{Result, UbiError};
pub use headers::VolType;
pub use load::VolumeSelector;
pub use reader::VolumeReader;
pub use scan::PebStatus;
pub use vtbl::VolumeTable;

/// The maximum number of PEBs that can be attached
pub const MAX_PEBS: u32 = 4096;

/// The maximum number of LEBs per loadable (static) volume
pub const MAX_VOL_LEBS: u32 = 256;

/// Volumes `0..VOL_IDS` are tracked; every other volume is ignored while scanning
pub const VOL_IDS: u32 = 16;

/// The maximum PEB size, which bounds the fastmap staging buffer and the LEB cache
pub const MAX_PEB_SIZE: u32 = 256 * 1024;

/// The outcome of a successful flash read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStatus {
    /// The data was read without issue
    Clean,

    /// The data was read correctly, but only thanks to ECC; the PEB should be scrubbed by whoever
    /// is able to write to it
    Bitflips,
}

/// The flash access needed to attach UBI: reading from a PEB, and asking whether a PEB is bad.
///
/// PEB numbers passed in already include the partition's PEB offset.
pub trait PebIo {
    /// Read `buf.len()` bytes starting `offset` bytes into PEB `pnum`
    fn read(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> anyhow::Result<ReadStatus>;

    /// Is PEB `pnum` marked bad?
    fn is_bad_peb(&mut self, pnum: u32) -> bool;
}

impl<T: PebIo + ?Sized> PebIo for &mut T {
    fn read(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        (**self).read(pnum, offset, buf)
    }

    fn is_bad_peb(&mut self, pnum: u32) -> bool {
        (**self).is_bad_peb(pnum)
    }
}
