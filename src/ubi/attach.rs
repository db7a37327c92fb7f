//! The attach state: geometry, the injected flash access, and everything learned by scanning.

use super::error::{Result, UbiError};
use super::fastmap;
use super::headers::{Vid, EC_HDR_SIZE, VID_HDR_SIZE};
use super::load::LebCache;
use super::vtbl::{VolumeTable, VtblState};
use super::{PebIo, ReadStatus, MAX_PEBS, MAX_PEB_SIZE, MAX_VOL_LEBS, VOL_IDS};
use crate::nand::NandLayout;
use crate::util::BitSet;

/// Where the UBI partition lives, and how its PEBs are laid out
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    /// Size of a PEB, in bytes
    pub peb_size: u32,

    /// Number of PEBs in the partition
    pub peb_count: u32,

    /// Index of the partition's PEB 0 within the whole flash device
    pub peb_offset: u32,

    /// Offset of the VID header within each PEB
    pub vid_offset: u32,

    /// Offset of the LEB data within each PEB
    pub leb_start: u32,
}

impl Geometry {
    /// The usable data size of each PEB
    pub fn leb_size(&self) -> u32 {
        self.peb_size.saturating_sub(self.leb_start)
    }

    /// Move the partition to start at another PEB of the device
    pub fn with_peb_offset(mut self, peb_offset: u32) -> Self {
        self.peb_offset = peb_offset;
        self
    }

    /// Limit the partition to a number of PEBs
    pub fn with_peb_count(mut self, peb_count: u32) -> Self {
        self.peb_count = peb_count;
        self
    }

    fn validate(&self) -> Result<()> {
        let fail = |what: &str| Err(UbiError::ParamInvalid(format!("{what} ({self:?})")));

        if self.peb_count == 0 || self.peb_count > MAX_PEBS {
            return fail("PEB count must be within 1..=MAX_PEBS");
        }
        if self.peb_size > MAX_PEB_SIZE {
            return fail("PEB size exceeds MAX_PEB_SIZE");
        }
        if self.leb_start >= self.peb_size {
            return fail("LEB start lies beyond the PEB");
        }
        if (self.vid_offset as usize) < EC_HDR_SIZE
            || self.vid_offset as usize + VID_HDR_SIZE > self.leb_start as usize
        {
            return fail("VID header must sit between the EC header and the LEB");
        }
        if self.peb_offset.checked_add(self.peb_count).is_none() {
            return fail("PEB offset overflows");
        }
        Ok(())
    }
}

/// The standard layout: EC header in page 0, VID header in page 1, data from page 2 onward
impl From<NandLayout> for Geometry {
    fn from(layout: NandLayout) -> Self {
        let page_size = layout.bytes_per_page as u32;
        Self {
            peb_size: layout.block_size() as u32,
            peb_count: layout.blocks,
            peb_offset: 0,
            vid_offset: page_size,
            leb_start: page_size * 2,
        }
    }
}

/// The injected flash access, translating partition-relative PEB numbers to device PEB numbers
#[derive(Debug)]
pub(super) struct Flash<I> {
    pub io: I,
    peb_offset: u32,
}

impl<I: PebIo> Flash<I> {
    pub fn read(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        self.io.read(pnum + self.peb_offset, offset, buf)
    }

    pub fn is_bad_peb(&mut self, pnum: u32) -> bool {
        self.io.is_bad_peb(pnum + self.peb_offset)
    }
}

/// What is known about one tracked volume
#[derive(Debug)]
pub(super) struct VolInfo {
    /// The highest LEB seen
    pub last_block: u32,

    /// Which LEBs are currently mapped
    pub found: BitSet,

    /// LEB to PEB translation; only meaningful where `found` is set
    pub lebs_to_pebs: Box<[u32]>,
}

impl VolInfo {
    fn new() -> Self {
        Self {
            last_block: 0,
            found: BitSet::new(MAX_VOL_LEBS as usize),
            lebs_to_pebs: vec![0; MAX_VOL_LEBS as usize].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.last_block = 0;
        self.found.clear_all();
        self.lebs_to_pebs.fill(0);
    }
}

/// The state of one UBI attach: everything known about the partition.
///
/// All storage is sized when the state is created and never grows afterwards.
#[derive(Debug)]
pub struct UbiAttach<I> {
    pub(super) flash: Flash<I>,
    pub(super) geometry: Geometry,

    /// The number of PEBs in use; may be cut short by an EOF marker
    pub(super) peb_count: u32,
    pub(super) leb_size: u32,

    pub(super) fm_enabled: bool,
    pub(super) fm_size: usize,
    pub(super) fm_anchor: Option<u32>,
    pub(super) fm_pebs: u32,
    pub(super) fm_used: BitSet,
    pub(super) fm_buf: Box<[u8]>,

    pub(super) scanned: BitSet,
    pub(super) corrupt: BitSet,

    /// PEBs found to carry the EOF marker
    pub(super) eof: BitSet,
    pub(super) blockinfo: Box<[Option<Vid>]>,
    pub(super) volinfo: Box<[VolInfo]>,

    pub(super) vtbl: VtblState,
    pub(super) sizes: [Option<u32>; VOL_IDS as usize],
    pub(super) cache: LebCache,
}

impl<I: PebIo> UbiAttach<I> {
    /// Attach to the UBI partition described by `geometry`, trying the fastmap first if `fastmap`
    /// is set and falling back to a full scan otherwise.
    pub fn init_scan(geometry: Geometry, io: I, fastmap: bool) -> Result<Self> {
        geometry.validate()?;

        let leb_size = geometry.leb_size();
        let peb_count = geometry.peb_count;
        let fm_size = fastmap::fm_size(peb_count, leb_size);

        let mut ubi = Self {
            flash: Flash {
                io,
                peb_offset: geometry.peb_offset,
            },
            geometry,
            peb_count,
            leb_size,
            fm_enabled: fastmap,
            fm_size,
            fm_anchor: None,
            fm_pebs: 0,
            fm_used: BitSet::new(peb_count as usize),
            fm_buf: vec![0; fm_size].into_boxed_slice(),
            scanned: BitSet::new(peb_count as usize),
            corrupt: BitSet::new(peb_count as usize),
            eof: BitSet::new(peb_count as usize),
            blockinfo: vec![None; peb_count as usize].into_boxed_slice(),
            volinfo: (0..VOL_IDS).map(|_| VolInfo::new()).collect(),
            vtbl: VtblState::Absent,
            sizes: [None; VOL_IDS as usize],
            cache: LebCache::new(leb_size as usize),
        };

        ubi.attach();
        Ok(ubi)
    }

    /// Forget everything and attach again, e.g. without fastmap after loading through one failed
    pub fn rescan(&mut self, fastmap: bool) {
        self.peb_count = self.geometry.peb_count;
        self.fm_enabled = fastmap;
        self.fm_anchor = None;
        self.fm_pebs = 0;
        self.fm_used.clear_all();
        self.scanned.clear_all();
        self.corrupt.clear_all();
        self.eof.clear_all();
        self.blockinfo.fill(None);
        self.reset_volumes();
        self.vtbl = VtblState::Absent;
        self.cache.invalidate();

        self.attach();
    }

    /// Drop every per-volume result, keeping what is known about individual PEBs
    pub(super) fn reset_volumes(&mut self) {
        self.volinfo.iter_mut().for_each(VolInfo::reset);
        self.sizes = [None; VOL_IDS as usize];
    }

    fn attach(&mut self) {
        let geometry = self.geometry;
        log::info!(
            "UBI: scanning [{:#x} - {:#x}] ...",
            u64::from(geometry.peb_offset) * u64::from(geometry.peb_size),
            u64::from(geometry.peb_offset + geometry.peb_count) * u64::from(geometry.peb_size),
        );

        self.full_scan();

        log::info!("UBI: scanning is finished");
        log::info!(
            "UBI: PEB size: {} bytes ({} KiB), LEB size: {} bytes",
            geometry.peb_size,
            geometry.peb_size >> 10,
            self.leb_size
        );
        log::info!(
            "UBI: VID header offset: {}, data offset: {}",
            geometry.vid_offset,
            geometry.leb_start
        );
    }

    /// Ensure `pnum` lies within the (possibly EOF-truncated) partition
    pub(super) fn check_pnum(&self, pnum: u32) -> Result<()> {
        if pnum >= self.peb_count {
            return Err(UbiError::ParamInvalid(format!(
                "PEB {pnum} beyond PEB count {}",
                self.peb_count
            )));
        }
        Ok(())
    }

    /// The PEB currently holding LEB `lnum` of volume `vol_id`, if known
    pub fn leb_to_peb(&self, vol_id: u32, lnum: u32) -> Option<u32> {
        let vi = self.volinfo.get(vol_id as usize)?;
        vi.found
            .test(lnum as usize)
            .then(|| vi.lebs_to_pebs[lnum as usize])
    }

    /// The highest LEB seen for volume `vol_id`, or None if none was seen at all
    pub fn last_block(&self, vol_id: u32) -> Option<u32> {
        let vi = self.volinfo.get(vol_id as usize)?;
        (vi.found.count() > 0 || vi.last_block > 0).then_some(vi.last_block)
    }

    pub fn is_corrupt(&self, pnum: u32) -> bool {
        self.corrupt.test(pnum as usize)
    }

    pub fn is_scanned(&self, pnum: u32) -> bool {
        self.scanned.test(pnum as usize)
    }

    /// The VID header read from a PEB, if it has been scanned and found valid
    pub fn header(&self, pnum: u32) -> Option<&Vid> {
        self.blockinfo.get(pnum as usize)?.as_ref()
    }

    /// The number of PEBs in use, after any EOF truncation
    pub fn peb_count(&self) -> u32 {
        self.peb_count
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Was this state attached from a fastmap (rather than a full scan)?
    pub fn fastmap_attached(&self) -> bool {
        self.fm_anchor.is_some()
    }

    /// The number of PEBs the fastmap accounted for
    pub fn fastmap_pebs(&self) -> u32 {
        self.fm_pebs
    }

    /// The volume table, if one has been found; an error if the one found is corrupt
    pub fn volume_table(&self) -> Result<Option<&VolumeTable>> {
        self.vtbl.get()
    }

    pub fn io(&self) -> &I {
        &self.flash.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.flash.io
    }
}
