//! This module contains the code necessary to read and write EC/VID headers and volume table
//! records, with CRC verification/computation.

use bytes::Buf;
use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite, DekuError};
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

/// UBI's CRC32: seeded with all-ones and never inverted at the end
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

pub const EC_HDR_SIZE: usize = 64;
pub const VID_HDR_SIZE: usize = 64;
pub const VTBL_RECORD_SIZE: usize = 0xAC;

/// Longest permitted volume name, excluding the terminating NUL
pub const VOL_NAME_MAX: usize = 127;

pub const INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;
pub const LAYOUT_VOLUME_ID: u32 = INTERNAL_VOL_START;
pub const FM_SB_VOLUME_ID: u32 = INTERNAL_VOL_START + 1;
pub const FM_DATA_VOLUME_ID: u32 = INTERNAL_VOL_START + 2;

/// The magic read back from a never-written header
pub const ERASED_MAGIC: u32 = 0xFFFF_FFFF;

/// Offset of the 3 reserved bytes following the EC header version; "EOF" here terminates the
/// used region of the flash.
pub const EC_HDR_PADDING1: usize = 5;
pub const EOF_MARKER: &[u8; 3] = b"EOF";

/// A trait missing from the `income` crate: implements parsing UBI headers from byteslices, with
/// magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((buf, 0)).ok()?;

        if (header.get_hdr_magic(), header.get_hdr_version()) != (Self::get_magic(), UBI_VERSION) {
            return None;
        }

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Another trait missing from `income` to compute the correct CRC for some header or record;
/// the CRC always covers every byte before the trailing CRC field.
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> Result<u32, DekuError> {
        let header_bytes = self.to_bytes()?;
        let header_len = header_bytes.len().saturating_sub(std::mem::size_of::<u32>());
        Ok(UBI_CRC.checksum(&header_bytes[..header_len]))
    }

    /// A header that cannot even be serialized never has a good CRC
    fn check_crc(&self) -> bool {
        self.compute_crc().is_ok_and(|crc| crc == self.get_crc())
    }

    fn fix_crc(&mut self) -> Result<(), DekuError> {
        self.set_crc(self.compute_crc()?);
        Ok(())
    }

    /// Serialize, with the CRC fixed up first
    fn to_bytes_with_crc(mut self) -> Result<Vec<u8>, DekuError>
    where
        Self: Sized,
    {
        self.fix_crc()?;
        self.to_bytes()
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VtblRecord {
    fn get_crc(&self) -> u32 {
        self.crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }
}

/// Read the big-endian magic number at the start of a header, if there are enough bytes
pub fn peek_magic(bytes: &[u8]) -> Option<u32> {
    let mut bytes = bytes.get(..std::mem::size_of::<u32>())?;
    Some(bytes.get_u32())
}

/// This represents the specific fields we care about in an EC header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        EcHdr::parse(bytes).map(|x| x.into())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = EcHdr::from(self).to_bytes_with_crc()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }

    /// Does this (raw) EC header carry the end-of-used-region marker? The header itself has to be
    /// intact for the marker to count.
    pub fn has_eof_marker(bytes: &[u8]) -> bool {
        Self::decode(bytes).is_some()
            && bytes.get(EC_HDR_PADDING1..EC_HDR_PADDING1 + EOF_MARKER.len())
                == Some(&EOF_MARKER[..])
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        Self {
            magic: *b"UBI#",
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        }
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        VidHdr::parse(bytes).and_then(|x| x.try_into().ok())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let bytes = VidHdr::from(self).to_bytes_with_crc()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        Self {
            magic: *b"UBI!",
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        }
    }
}

/// This represents the specific fields we care about in a volume table record
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Write into a Vec<u8>
    pub fn into_bytes(self) -> Result<Vec<u8>, DekuError> {
        VtblRecord::from(self).to_bytes_with_crc()
    }

    /// Represent an empty entry in the volume table
    pub fn none_into_bytes() -> Result<Vec<u8>, DekuError> {
        let record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        record.to_bytes_with_crc()
    }
}

pub trait OptionIntoBytes {
    fn into_bytes(self) -> Result<Vec<u8>, DekuError>;
}

impl OptionIntoBytes for Option<VolTableRecord> {
    fn into_bytes(self) -> Result<Vec<u8>, DekuError> {
        match self {
            Some(x) => x.into_bytes(),
            None => VolTableRecord::none_into_bytes(),
        }
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = ();

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let upd_marker = upd_marker != 0;
        let name = std::str::from_utf8(name.get(..name_len as usize).ok_or(())?)
            .map_err(|_| ())?
            .to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();

        // Longer names are cut short, keeping the terminating NUL
        let name_bytes = &name.as_bytes()[..name.len().min(VOL_NAME_MAX)];
        let name_len = name_bytes.len() as _;
        let mut name = std::array::from_fn(|_| 0u8);
        name[..name_bytes.len()].copy_from_slice(name_bytes);

        Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        }
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec::default();
    let vid = Vid::default();
    let vtbl = VolTableRecord {
        alignment: 1024,
        name: "example".to_string(),
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Some(ec));

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Some(vid));

    let vec = vtbl.clone().into_bytes()?;
    assert_eq!(vec.len(), VTBL_RECORD_SIZE);
    let (_, raw) = VtblRecord::from_bytes((&vec[..], 0))?;
    assert!(raw.check_crc());
    assert_eq!(VolTableRecord::try_from(raw), Ok(vtbl));

    Ok(())
}

#[test]
fn test_header_sizes() -> anyhow::Result<()> {
    assert_eq!(EcHdr::from(Ec::default()).to_bytes_with_crc()?.len(), EC_HDR_SIZE);
    assert_eq!(VidHdr::from(Vid::default()).to_bytes_with_crc()?.len(), VID_HDR_SIZE);
    assert_eq!(VolTableRecord::none_into_bytes()?.len(), VTBL_RECORD_SIZE);
    Ok(())
}

#[test]
fn test_vid_crc() -> anyhow::Result<()> {
    let vid = Vid {
        vol_type: VolType::Static,
        vol_id: 5,
        lnum: 3,
        data_size: 2048,
        used_ebs: 4,
        data_crc: 0x1234_5678,
        sqnum: 20,
        ..Default::default()
    };
    let mut buf = vec![0u8; VID_HDR_SIZE];
    vid.encode(&mut buf)?;

    // The stored CRC covers every byte but itself
    let stored = u32::from_be_bytes(buf[VID_HDR_SIZE - 4..].try_into()?);
    assert_eq!(stored, UBI_CRC.checksum(&buf[..VID_HDR_SIZE - 4]));
    assert_eq!(peek_magic(&buf), Some(0x5542_4921));

    // Any single flipped bit outside the CRC makes the header unreadable
    for bit in [0, 8 * 12 + 3, 8 * 40, 8 * 59 + 7] {
        let mut corrupt = buf.clone();
        corrupt[bit / 8] ^= 1 << (bit % 8);
        assert_eq!(Vid::decode(&corrupt), None, "bit {bit}");
    }

    Ok(())
}

#[test]
fn test_empty_vtbl_record() -> anyhow::Result<()> {
    // The canonical empty record is all zeroes apart from its CRC
    let empty = VolTableRecord::none_into_bytes()?;
    assert!(empty[..VTBL_RECORD_SIZE - 4].iter().all(|&b| b == 0));
    assert_eq!(&empty[VTBL_RECORD_SIZE - 4..], &0xf116_c36bu32.to_be_bytes());
    Ok(())
}

#[test]
fn test_crc_fixed_when_serialized() -> anyhow::Result<()> {
    let vid = Vid {
        vol_id: 3,
        sqnum: 7,
        ..Default::default()
    };
    let mut hdr = VidHdr::from(vid);
    assert!(!hdr.check_crc());

    let bytes = VidHdr::from(vid).to_bytes_with_crc()?;
    let (_, parsed) = VidHdr::from_bytes((&bytes[..], 0))?;
    assert!(parsed.check_crc());

    hdr.fix_crc()?;
    assert_eq!(hdr.get_crc(), parsed.get_crc());
    assert_eq!(hdr.compute_crc()?, parsed.get_crc());
    Ok(())
}

#[test]
fn test_eof_marker() -> anyhow::Result<()> {
    let mut buf = vec![0xFFu8; EC_HDR_SIZE];
    assert!(!Ec::has_eof_marker(&buf));

    Ec::default().encode(&mut buf)?;
    assert!(!Ec::has_eof_marker(&buf));

    // The marker only counts once the CRC is fixed up
    buf[EC_HDR_PADDING1..][..3].copy_from_slice(EOF_MARKER);
    assert!(!Ec::has_eof_marker(&buf));
    let crc = UBI_CRC.checksum(&buf[..EC_HDR_SIZE - 4]);
    buf[EC_HDR_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
    assert!(Ec::has_eof_marker(&buf));

    assert_eq!(peek_magic(&[0xFF; 3]), None);
    Ok(())
}
