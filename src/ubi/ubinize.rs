//! This module builds UBI flash images in a [SimNand], for the tests of the attach and load code.
//!
//! Unlike a real ubinize, nothing here is careful: PEBs are written wherever the test says, in any
//! order, with any sequence numbers, and can be deliberately broken in all the ways UBI has to
//! cope with. A [FastmapImage] can also be taken of whatever has been written so far, edited, and
//! written out as a fastmap.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::ensure;

use super::attach::{Geometry, UbiAttach};
use super::fastmap::*;
use super::headers::*;
use super::{PebIo, ReadStatus};
use crate::nand::{NandLayout, NandPebIo, SimNand};

/// 64 PEBs of 6 pages of 512 bytes: a 2 KiB LEB after the EC and VID header pages
pub const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 64,
    pages_per_block: 6,
    bytes_per_page: 512,
};

const UBI_LAYOUT_VOLUME_TYPE: VolType = VolType::Dynamic;
const UBI_LAYOUT_VOLUME_EBS: u32 = 2;
const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5u8;
const UBI_MAX_VOLUMES: usize = 128;

/// Sequence numbers handed out to internal volumes start here, well above what tests pick
const INTERNAL_SQNUM_BASE: u64 = 1000;

/// Any byte that makes neither an erased page nor a valid header
const GARBAGE: u8 = 0x5A;

/// Unmapped entry of a fastmap EBA table
const UNMAPPED: u32 = 0xFFFF_FFFF;

/// The VID header of a static volume LEB holding `data`
fn static_vid(vol_id: u32, lnum: u32, used_ebs: u32, sqnum: u64, data: &[u8]) -> Vid {
    Vid {
        vol_type: VolType::Static,
        vol_id,
        lnum,
        data_size: data.len() as u32,
        used_ebs,
        data_crc: UBI_CRC.checksum(data),
        sqnum,
        ..Default::default()
    }
}

/// A flash image under construction
pub struct FlashImage {
    nand: SimNand,
    layout: NandLayout,
    geometry: Geometry,
    sqnum: u64,

    /// Every VID header written, in order
    written: Vec<(u32, Vid)>,
}

impl FlashImage {
    /// Start out with a blank flash
    pub fn new(layout: NandLayout) -> Self {
        Self {
            nand: SimNand::new(layout),
            layout,
            geometry: layout.into(),
            sqnum: INTERNAL_SQNUM_BASE,
            written: Vec::new(),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn next_sqnum(&mut self) -> u64 {
        self.sqnum += 1;
        self.sqnum
    }

    /// Program a whole PEB: EC header, then the VID header (if any) and LEB data
    fn write_raw_leb(&mut self, pnum: u32, vid: Option<Vid>, data: &[u8]) -> anyhow::Result<()> {
        let Geometry {
            vid_offset,
            leb_start,
            ..
        } = self.geometry;
        ensure!(
            data.len() <= self.geometry.leb_size() as usize,
            "{} bytes of data do not fit in a LEB",
            data.len()
        );

        let page_size = self.layout.bytes_per_page;
        let len = (leb_start as usize + data.len()).div_ceil(page_size) * page_size;
        let mut buf = vec![0xFFu8; len];

        Ec {
            ec: 1,
            vid_hdr_offset: vid_offset,
            data_offset: leb_start,
            image_seq: 0,
        }
        .encode(&mut buf)?;

        if let Some(vid) = vid {
            vid.encode(&mut buf[vid_offset as usize..])?;
            self.written.push((pnum, vid));
        }
        buf[leb_start as usize..][..data.len()].copy_from_slice(data);

        self.nand.raw_block(pnum)?.program(0, &buf)
    }

    /// Write LEB `lnum` of a static volume of `used_ebs` LEBs
    pub fn write_leb(
        &mut self,
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        used_ebs: u32,
        sqnum: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let vid = static_vid(vol_id, lnum, used_ebs, sqnum, data);
        self.write_raw_leb(pnum, Some(vid), data)
    }

    /// Like [Self::write_leb], but bit `bit` of the data is flipped after the header's data CRC
    /// has been computed
    #[allow(clippy::too_many_arguments)]
    pub fn write_damaged_leb(
        &mut self,
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        used_ebs: u32,
        sqnum: u64,
        data: &[u8],
        bit: usize,
    ) -> anyhow::Result<()> {
        let vid = static_vid(vol_id, lnum, used_ebs, sqnum, data);
        let mut damaged = data.to_vec();
        ensure!(bit / 8 < damaged.len(), "bit {bit} beyond the data");
        damaged[bit / 8] ^= 1 << (bit % 8);
        self.write_raw_leb(pnum, Some(vid), &damaged)
    }

    /// Write a whole static volume to consecutive PEBs, starting at `first_pnum`
    pub fn write_static_volume(
        &mut self,
        vol_id: u32,
        data: &[u8],
        first_pnum: u32,
        sqnum: u64,
    ) -> anyhow::Result<()> {
        let chunks: Vec<_> = data.chunks(self.geometry.leb_size() as usize).collect();
        let used_ebs = chunks.len() as u32;

        for (lnum, chunk) in (0..).zip(chunks) {
            self.write_leb(first_pnum + lnum, vol_id, lnum, used_ebs, sqnum, chunk)?;
        }
        Ok(())
    }

    /// Write a LEB of a dynamic volume, which carries no data CRC
    pub fn write_dynamic_leb(
        &mut self,
        pnum: u32,
        vol_id: u32,
        lnum: u32,
        sqnum: u64,
    ) -> anyhow::Result<()> {
        let vid = Vid {
            vol_type: VolType::Dynamic,
            vol_id,
            lnum,
            sqnum,
            ..Default::default()
        };
        self.write_raw_leb(pnum, Some(vid), &[])
    }

    /// Write both copies of the layout volume, with a record for each of `volumes`
    pub fn write_layout_volume(
        &mut self,
        volumes: &[(u32, &str)],
        pebs: [u32; UBI_LAYOUT_VOLUME_EBS as usize],
    ) -> anyhow::Result<()> {
        let record_count =
            (self.geometry.leb_size() as usize / VTBL_RECORD_SIZE).min(UBI_MAX_VOLUMES);
        let mut records: Vec<Option<VolTableRecord>> = vec![None; record_count];

        for &(id, name) in volumes {
            let slot = records
                .get_mut(id as usize)
                .ok_or(anyhow::anyhow!("volume id {id} has no room in the table"))?;
            *slot = Some(VolTableRecord {
                reserved_pebs: 4,
                alignment: 1,
                data_pad: 0,
                vol_type: VolType::Static,
                name: name.to_string(),
                ..Default::default()
            });
        }

        let mut data = Vec::new();
        for record in records {
            data.extend(record.into_bytes()?);
        }

        for (lnum, pnum) in (0..).zip(pebs) {
            let vid = Vid {
                vol_type: UBI_LAYOUT_VOLUME_TYPE,
                compat: UBI_LAYOUT_VOLUME_COMPAT,
                vol_id: LAYOUT_VOLUME_ID,
                lnum,
                sqnum: self.next_sqnum(),
                ..Default::default()
            };
            self.write_raw_leb(pnum, Some(vid), &data)?;
        }
        Ok(())
    }

    /// Write a valid VID header over a LEB full of junk
    pub fn write_garbage_leb(&mut self, pnum: u32, vol_id: u32, lnum: u32) -> anyhow::Result<()> {
        let vid = Vid {
            vol_type: VolType::Dynamic,
            vol_id,
            lnum,
            sqnum: self.next_sqnum(),
            ..Default::default()
        };
        let data = vec![GARBAGE; self.geometry.leb_size() as usize];
        self.write_raw_leb(pnum, Some(vid), &data)
    }

    /// Fill a whole PEB with junk, headers included
    pub fn write_garbage(&mut self, pnum: u32) -> anyhow::Result<()> {
        let data = vec![GARBAGE; self.geometry.peb_size as usize];
        self.nand.raw_block(pnum)?.program(0, &data)
    }

    /// Write an EC header, but no VID header, as UBI does after erasing a PEB
    pub fn write_ec_only(&mut self, pnum: u32) -> anyhow::Result<()> {
        self.write_raw_leb(pnum, None, &[])
    }

    /// Write the EC header that ends the used region of the flash
    pub fn write_eof_marker(&mut self, pnum: u32) -> anyhow::Result<()> {
        let mut buf = vec![0xFFu8; self.geometry.vid_offset as usize];
        Ec::default().encode(&mut buf)?;
        buf[EC_HDR_PADDING1..][..EOF_MARKER.len()].copy_from_slice(EOF_MARKER);

        let crc = UBI_CRC.checksum(&buf[..EC_HDR_SIZE - 4]);
        buf[EC_HDR_SIZE - 4..EC_HDR_SIZE].copy_from_slice(&crc.to_be_bytes());

        self.nand.raw_block(pnum)?.program(0, &buf)
    }

    pub fn mark_bad(&mut self, pnum: u32) -> anyhow::Result<()> {
        self.nand.raw_block(pnum)?.mark_bad();
        Ok(())
    }

    pub fn into_io(self) -> NandPebIo<SimNand> {
        NandPebIo::new(self.nand)
    }

    /// Attach to the image as it stands
    pub fn attach(self, fastmap: bool) -> anyhow::Result<UbiAttach<NandPebIo<SimNand>>> {
        let geometry = self.geometry;
        Ok(UbiAttach::init_scan(geometry, self.into_io(), fastmap)?)
    }

    /// Describe everything written so far the way a fastmap would: the newest copy of every LEB
    /// of every volume, fastmap volumes excepted.
    pub fn snapshot(&self) -> FastmapImage {
        let mut volumes: BTreeMap<u32, BTreeMap<u32, (u32, Vid)>> = BTreeMap::new();

        for &(pnum, vid) in &self.written {
            if matches!(vid.vol_id, FM_SB_VOLUME_ID | FM_DATA_VOLUME_ID) {
                continue;
            }

            let lebs = volumes.entry(vid.vol_id).or_default();
            match lebs.get(&vid.lnum) {
                Some((_, cur)) if cur.sqnum >= vid.sqnum => (),
                _ => {
                    lebs.insert(vid.lnum, (pnum, vid));
                }
            }
        }

        let mut image = FastmapImage::default();
        for (vol_id, lebs) in volumes {
            let Some(&(_, first)) = lebs.values().next() else {
                continue;
            };
            let leb_count = lebs.keys().max().map_or(0, |&lnum| lnum + 1);
            let used_ebs = match first.vol_type {
                VolType::Static => lebs.values().map(|(_, vid)| vid.used_ebs).max().unwrap_or(0),
                VolType::Dynamic => leb_count,
            };

            let mut pebs = vec![UNMAPPED; leb_count.max(used_ebs) as usize];
            for (&lnum, &(pnum, _)) in &lebs {
                pebs[lnum as usize] = pnum;
                image.used.push(pnum);
            }

            image.volumes.push(FmVolume {
                vol_id,
                vol_type: first.vol_type,
                used_ebs,
                pebs,
            });
        }

        image
    }

    /// Write `snapshot` as a fastmap spread over `blocks`, the first of which is the anchor
    pub fn write_fastmap(&mut self, snapshot: &FastmapImage, blocks: &[u32]) -> anyhow::Result<()> {
        self.write_fastmap_inner(snapshot, blocks, |_| (), |_| ())
    }

    /// Like [Self::write_fastmap], but `edit` may damage the fastmap after its CRC is computed
    pub fn write_fastmap_with(
        &mut self,
        snapshot: &FastmapImage,
        blocks: &[u32],
        edit: impl FnOnce(&mut [u8]),
    ) -> anyhow::Result<()> {
        self.write_fastmap_inner(snapshot, blocks, |_| (), edit)
    }

    /// Like [Self::write_fastmap], but `edit` may change the super-block before the CRC is
    /// computed
    pub(super) fn write_fastmap_sb(
        &mut self,
        snapshot: &FastmapImage,
        blocks: &[u32],
        edit: impl FnOnce(&mut FmSb),
    ) -> anyhow::Result<()> {
        self.write_fastmap_inner(snapshot, blocks, edit, |_| ())
    }

    fn write_fastmap_inner(
        &mut self,
        snapshot: &FastmapImage,
        blocks: &[u32],
        edit_sb: impl FnOnce(&mut FmSb),
        edit_buf: impl FnOnce(&mut [u8]),
    ) -> anyhow::Result<()> {
        let leb_size = self.geometry.leb_size() as usize;
        let peb_count = self.geometry.peb_count;
        let size = fm_size(peb_count, leb_size as u32);

        ensure!(
            !blocks.is_empty() && blocks.len() <= FM_MAX_BLOCKS as usize,
            "a fastmap spans 1..={FM_MAX_BLOCKS} blocks"
        );
        let mut block_loc = [0u32; FM_MAX_BLOCKS as usize];
        block_loc[..blocks.len()].copy_from_slice(blocks);

        let mut sb = FmSb {
            magic: FM_SB_MAGIC,
            version: FM_FMT_VERSION,
            padding1: [0; 3],
            data_crc: 0,
            used_blocks: blocks.len() as u32,
            block_loc,
            block_ec: [1; FM_MAX_BLOCKS as usize],
            sqnum: self.next_sqnum(),
            padding2: [0; 32],
        };
        edit_sb(&mut sb);

        // Everything not accounted for otherwise is free
        let taken: BTreeSet<u32> = (snapshot.used.iter())
            .chain(&snapshot.pool)
            .chain(&snapshot.wl_pool)
            .chain(blocks)
            .copied()
            .collect();
        let free: Vec<u32> = (0..peb_count).filter(|pnum| !taken.contains(pnum)).collect();

        let hdr = FmHdr {
            magic: FM_HDR_MAGIC,
            free_peb_count: free.len() as u32,
            used_peb_count: snapshot.used.len() as u32,
            scrub_peb_count: 0,
            bad_peb_count: 0,
            erase_peb_count: 0,
            vol_count: snapshot.volumes.len() as u32,
            padding: [0; 4],
        };

        let mut buf = Vec::with_capacity(size);
        buf.extend(sb.to_bytes()?);
        buf.extend(hdr.to_bytes()?);
        buf.extend(scan_pool(&snapshot.pool)?.to_bytes()?);
        buf.extend(scan_pool(&snapshot.wl_pool)?.to_bytes()?);

        for &pnum in free.iter().chain(&snapshot.used) {
            buf.extend(FmEc { pnum, ec: 1 }.to_bytes()?);
        }

        for vol in &snapshot.volumes {
            let vhdr = FmVolHdr {
                magic: FM_VHDR_MAGIC,
                vol_id: vol.vol_id,
                vol_type: vol.vol_type.into(),
                padding1: [0; 3],
                data_pad: 0,
                used_ebs: vol.used_ebs,
                last_eb_bytes: leb_size as u32,
                padding2: [0; 8],
            };
            let eba = FmEba {
                magic: FM_EBA_MAGIC,
                reserved_pebs: vol.pebs.len() as u32,
            };
            buf.extend(vhdr.to_bytes()?);
            buf.extend(eba.to_bytes()?);
            vol.pebs.iter().for_each(|pnum| buf.extend(pnum.to_be_bytes()));
        }

        ensure!(buf.len() < size, "fastmap of {} bytes overflows", buf.len());
        buf.resize(size, 0);

        buf[FM_SB_DATA_CRC].fill(0);
        let crc = UBI_CRC.checksum(&buf);
        buf[FM_SB_DATA_CRC].copy_from_slice(&crc.to_be_bytes());
        edit_buf(&mut buf);

        for ((lnum, &pnum), chunk) in (0..).zip(blocks).zip(buf.chunks(leb_size)) {
            let vid = Vid {
                vol_type: VolType::Dynamic,
                vol_id: if lnum == 0 {
                    FM_SB_VOLUME_ID
                } else {
                    FM_DATA_VOLUME_ID
                },
                lnum,
                sqnum: self.next_sqnum(),
                ..Default::default()
            };
            self.write_raw_leb(pnum, Some(vid), chunk)?;
        }
        Ok(())
    }
}

fn scan_pool(pebs: &[u32]) -> anyhow::Result<FmScanPool> {
    ensure!(pebs.len() <= FM_MAX_POOL_SIZE, "pool too large");
    let mut pool = FmScanPool {
        magic: FM_POOL_MAGIC,
        size: pebs.len() as u16,
        max_size: FM_MAX_POOL_SIZE as u16,
        pebs: [0; FM_MAX_POOL_SIZE],
        padding: [0; 4],
    };
    pool.pebs[..pebs.len()].copy_from_slice(pebs);
    Ok(pool)
}

/// The content of a fastmap, before it is serialized
#[derive(Debug, Clone, Default)]
pub struct FastmapImage {
    /// PEBs that may have been written since the fastmap
    pub pool: Vec<u32>,
    pub wl_pool: Vec<u32>,

    /// PEBs holding LEBs of some volume
    pub used: Vec<u32>,
    pub volumes: Vec<FmVolume>,
}

impl FastmapImage {
    pub fn volume_mut(&mut self, vol_id: u32) -> anyhow::Result<&mut FmVolume> {
        self.volumes
            .iter_mut()
            .find(|vol| vol.vol_id == vol_id)
            .ok_or(anyhow::anyhow!("no volume {vol_id} in the snapshot"))
    }
}

/// One volume of a fastmap, with its EBA table
#[derive(Debug, Clone)]
pub struct FmVolume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub used_ebs: u32,
    pub pebs: Vec<u32>,
}

/// Counts the reads made through it
pub struct CountingIo<I> {
    inner: I,
    reads: Vec<u32>,
}

impl<I> CountingIo<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            reads: Vec::new(),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.len()
    }

    pub fn reads_of(&self, pnum: u32) -> usize {
        self.reads.iter().filter(|&&x| x == pnum).count()
    }
}

impl<I: PebIo> PebIo for CountingIo<I> {
    fn read(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        self.reads.push(pnum);
        self.inner.read(pnum, offset, buf)
    }

    fn is_bad_peb(&mut self, pnum: u32) -> bool {
        self.inner.is_bad_peb(pnum)
    }
}

/// Makes reads of chosen PEBs fail, or report corrected bitflips
pub struct FaultyIo<I> {
    inner: I,
    failing: BTreeSet<u32>,
    flipping: BTreeSet<u32>,
}

impl<I> FaultyIo<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            failing: BTreeSet::new(),
            flipping: BTreeSet::new(),
        }
    }

    pub fn failing(mut self, pebs: impl IntoIterator<Item = u32>) -> Self {
        self.failing.extend(pebs);
        self
    }

    pub fn flipping(mut self, pebs: impl IntoIterator<Item = u32>) -> Self {
        self.flipping.extend(pebs);
        self
    }

    /// Make every further read of `pnum` fail
    pub fn fail(&mut self, pnum: u32) {
        self.failing.insert(pnum);
    }

    pub fn heal(&mut self, pnum: u32) {
        self.failing.remove(&pnum);
    }
}

impl<I: PebIo> PebIo for FaultyIo<I> {
    fn read(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        ensure!(!self.failing.contains(&pnum), "injected failure on PEB {pnum}");

        let status = self.inner.read(pnum, offset, buf)?;
        if self.flipping.contains(&pnum) {
            return Ok(ReadStatus::Bitflips);
        }
        Ok(status)
    }

    fn is_bad_peb(&mut self, pnum: u32) -> bool {
        self.inner.is_bad_peb(pnum)
    }
}

#[test]
fn test_image_headers() -> anyhow::Result<()> {
    let mut image = FlashImage::new(TEST_LAYOUT);
    image.write_leb(3, 2, 1, 4, 77, &[0x42; 100])?;
    image.write_eof_marker(9)?;
    let geometry = image.geometry();
    let mut io = image.into_io();

    let mut buf = vec![0u8; geometry.leb_start as usize + 100];
    io.read(3, 0, &mut buf)?;

    let ec = Ec::decode(&buf).ok_or(anyhow::anyhow!("no EC header"))?;
    assert_eq!(ec.vid_hdr_offset, geometry.vid_offset);
    assert_eq!(ec.data_offset, geometry.leb_start);

    let vid = Vid::decode(&buf[geometry.vid_offset as usize..])
        .ok_or(anyhow::anyhow!("no VID header"))?;
    assert_eq!((vid.vol_id, vid.lnum, vid.used_ebs, vid.sqnum), (2, 1, 4, 77));
    assert_eq!(vid.data_crc, UBI_CRC.checksum(&[0x42; 100]));
    assert!(buf[geometry.leb_start as usize..].iter().all(|&b| b == 0x42));

    io.read(9, 0, &mut buf[..EC_HDR_SIZE])?;
    assert!(Ec::has_eof_marker(&buf[..EC_HDR_SIZE]));
    Ok(())
}

#[test]
fn test_snapshot_keeps_newest() -> anyhow::Result<()> {
    let mut image = FlashImage::new(TEST_LAYOUT);
    image.write_leb(10, 1, 0, 2, 5, &[1; 10])?;
    image.write_leb(11, 1, 0, 2, 9, &[2; 10])?;
    image.write_leb(12, 1, 0, 2, 7, &[3; 10])?;
    image.write_layout_volume(&[(1, "one")], [4, 5])?;

    let mut snapshot = image.snapshot();
    assert_eq!(snapshot.volumes.len(), 2);

    let vol = snapshot.volume_mut(1)?;
    assert_eq!(vol.used_ebs, 2);
    assert_eq!(vol.pebs, [11, UNMAPPED]);

    let layout = snapshot.volume_mut(LAYOUT_VOLUME_ID)?;
    assert_eq!((layout.vol_type, layout.used_ebs), (VolType::Dynamic, 2));
    assert!(snapshot.volume_mut(2).is_err());
    Ok(())
}
