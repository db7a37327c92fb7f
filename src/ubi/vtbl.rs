//! The volume table: the directory of named volumes, stored (twice) in the layout volume.

use income::VtblRecord;

use super::error::{Result, UbiError};
use super::headers::{
    ComputeCrc, DekuContainerRead, VolTableRecord, VolType, VOL_NAME_MAX, VTBL_RECORD_SIZE,
};
use super::VOL_IDS;

/// The records of the tracked volumes, indexed by volume id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeTable {
    records: Vec<Option<VolTableRecord>>,
}

impl VolumeTable {
    /// The number of bytes occupied by the records we look at
    pub const BYTES: usize = VTBL_RECORD_SIZE * VOL_IDS as usize;

    /// How many bytes of the table to read from a layout volume LEB of `leb_size` bytes; small
    /// LEBs hold fewer records than there are tracked volumes.
    pub fn read_size(leb_size: u32) -> usize {
        Self::BYTES.min(leb_size as usize / VTBL_RECORD_SIZE * VTBL_RECORD_SIZE)
    }

    /// Parse and cross-check the table at the start of a layout volume LEB. Volume ids with no
    /// record in `bytes` are treated as empty.
    pub fn parse(bytes: &[u8], leb_size: u32, vid_offset: u32) -> Result<Self> {
        let bytes = &bytes[..bytes.len().min(Self::BYTES)];
        if bytes.len() < VTBL_RECORD_SIZE {
            return Err(UbiError::BadVolumeTable("table truncated".into()));
        }

        let empty = VolTableRecord::none_into_bytes()
            .map_err(|e| UbiError::BadVolumeTable(format!("empty record: {e}")))?;
        let mut records = Vec::with_capacity(VOL_IDS as usize);

        for (index, raw) in bytes.chunks_exact(VTBL_RECORD_SIZE).enumerate() {
            let record = check_record(raw, &empty, leb_size, vid_offset).map_err(|reason| {
                log::error!("UBI error: volume table check failed: record {index}, {reason}");
                UbiError::BadVolumeTable(format!("record {index}: {reason}"))
            })?;
            records.push(record);
        }
        records.resize(VOL_IDS as usize, None);

        // Names must be unique
        for (i, first) in records.iter().enumerate() {
            let Some(first) = first else { continue };
            for (n, second) in records.iter().enumerate().skip(i + 1) {
                if second.as_ref().is_some_and(|second| second.name == first.name) {
                    log::error!(
                        "UBI error: volumes {i} and {n} have the same name \"{}\"",
                        first.name
                    );
                    return Err(UbiError::BadVolumeTable(format!(
                        "volumes {i} and {n} have the same name"
                    )));
                }
            }
        }

        Ok(Self { records })
    }

    /// Get the record for a volume id, if that volume exists
    pub fn get(&self, vol_id: u32) -> Option<&VolTableRecord> {
        self.records.get(vol_id as usize)?.as_ref()
    }

    /// Look up the id of a volume by its name
    pub fn find(&self, name: &str) -> Option<u32> {
        self.records
            .iter()
            .position(|record| record.as_ref().is_some_and(|r| r.name == name))
            .map(|id| id as u32)
    }

    /// Iterate over the existing volumes, with their ids
    pub fn iter(&self) -> impl Iterator<Item = (u32, &VolTableRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(id, record)| Some((id as u32, record.as_ref()?)))
    }
}

/// Validate one raw record, returning None for an empty slot
fn check_record(
    raw: &[u8],
    empty: &[u8],
    leb_size: u32,
    vid_offset: u32,
) -> std::result::Result<Option<VolTableRecord>, String> {
    let (_, record) = VtblRecord::from_bytes((raw, 0)).map_err(|e| e.to_string())?;

    let crc = record.compute_crc().map_err(|e| e.to_string())?;
    if crc != record.crc {
        return Err(format!("bad CRC {:#010x}, not {crc:#010x}", record.crc));
    }

    if record.reserved_pebs == 0 {
        if raw != empty {
            return Err("empty record is not all zeroes".into());
        }
        return Ok(None);
    }

    // Signed on flash; anything with the top bit set is negative
    if [record.reserved_pebs, record.alignment, record.data_pad]
        .iter()
        .any(|&x| x > i32::MAX as u32)
    {
        return Err("negative size field".into());
    }

    let alignment = record.alignment;
    if alignment == 0 || alignment > leb_size {
        return Err(format!("bad alignment {alignment}"));
    }
    if alignment != 1 && alignment & vid_offset.wrapping_sub(1) != 0 {
        return Err(format!("alignment {alignment} not a multiple of the I/O unit"));
    }

    let data_pad = leb_size % alignment;
    if record.data_pad != data_pad {
        return Err(format!("bad data_pad, has to be {data_pad}"));
    }

    if VolType::try_from(record.vol_type).is_err() {
        return Err(format!("bad volume type {}", record.vol_type));
    }
    if record.upd_marker > 1 {
        return Err(format!("bad update marker {}", record.upd_marker));
    }

    let name_len = record.name_len as usize;
    if name_len > VOL_NAME_MAX {
        return Err(format!("name length {name_len} too long"));
    }
    if record.name[0] == 0 {
        return Err("empty name".into());
    }
    let nul = record
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(record.name.len());
    if nul != name_len {
        return Err(format!("name length {name_len} disagrees with name"));
    }

    VolTableRecord::try_from(record)
        .map(Some)
        .map_err(|_| "name is not UTF-8".to_string())
}

/// Whether a volume table has been found yet, and if so, whether it is any good
#[derive(Debug, Clone, Default)]
pub(super) enum VtblState {
    #[default]
    Absent,
    Invalid(String),
    Valid(VolumeTable),
}

impl VtblState {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn get(&self) -> Result<Option<&VolumeTable>> {
        match self {
            Self::Absent => Ok(None),
            Self::Invalid(reason) => Err(UbiError::BadVolumeTable(reason.clone())),
            Self::Valid(table) => Ok(Some(table)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::headers::OptionIntoBytes;

    const LEB_SIZE: u32 = 2048;
    const VID_OFFSET: u32 = 512;

    fn record(name: &str) -> VolTableRecord {
        VolTableRecord {
            reserved_pebs: 4,
            alignment: 1,
            data_pad: 0,
            vol_type: VolType::Static,
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn table_bytes(records: Vec<Option<VolTableRecord>>) -> Vec<u8> {
        let mut records = records;
        records.resize(VOL_IDS as usize, None);
        records
            .into_iter()
            .flat_map(|r| r.into_bytes().expect("records serialize"))
            .collect()
    }

    #[test]
    fn test_empty_table() -> anyhow::Result<()> {
        let table = VolumeTable::parse(&table_bytes(vec![]), LEB_SIZE, VID_OFFSET)?;
        assert_eq!(table.iter().count(), 0);
        assert_eq!(table.find("anything"), None);
        Ok(())
    }

    #[test]
    fn test_named_volumes() -> anyhow::Result<()> {
        let bytes = table_bytes(vec![None, Some(record("fip")), None, Some(record("kernel"))]);
        let table = VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET)?;

        assert_eq!(table.find("fip"), Some(1));
        assert_eq!(table.find("kernel"), Some(3));
        assert_eq!(table.find("kern"), None);
        assert_eq!(table.get(3).map(|r| r.reserved_pebs), Some(4));
        assert_eq!(table.get(2), None);
        assert_eq!(table.get(VOL_IDS), None);
        Ok(())
    }

    #[test]
    fn test_rejects_zero_alignment() {
        let bytes = table_bytes(vec![Some(VolTableRecord {
            alignment: 0,
            ..record("fip")
        })]);
        assert!(matches!(
            VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET),
            Err(UbiError::BadVolumeTable(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let bytes = table_bytes(vec![Some(record("fip")), None, Some(record("fip"))]);
        assert!(VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET).is_err());
    }

    #[test]
    fn test_rejects_bad_fields() {
        let bad = [
            VolTableRecord {
                alignment: LEB_SIZE + 1,
                ..record("a")
            },
            VolTableRecord {
                alignment: 3,
                data_pad: LEB_SIZE % 3,
                ..record("a")
            },
            VolTableRecord {
                data_pad: 1,
                ..record("a")
            },
            record(""),
        ];
        for r in bad {
            let bytes = table_bytes(vec![Some(r.clone())]);
            assert!(
                VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET).is_err(),
                "{r:?}"
            );
        }

        // Alignment to the I/O unit is fine
        let bytes = table_bytes(vec![Some(VolTableRecord {
            alignment: 1024,
            data_pad: 0,
            ..record("a")
        })]);
        assert!(VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET).is_ok());
    }

    #[test]
    fn test_rejects_bad_crc_and_dirty_empty_record() {
        let mut bytes = table_bytes(vec![Some(record("fip"))]);
        bytes[20] ^= 0x01;
        assert!(VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET).is_err());

        // An empty record with stray bytes, even with a correct CRC
        let mut dirty = VolTableRecord::none_into_bytes().expect("empty record serializes");
        dirty[100] = b'x';
        let crc = crate::ubi::headers::UBI_CRC.checksum(&dirty[..VTBL_RECORD_SIZE - 4]);
        dirty[VTBL_RECORD_SIZE - 4..].copy_from_slice(&crc.to_be_bytes());
        let mut bytes = table_bytes(vec![]);
        bytes[..VTBL_RECORD_SIZE].copy_from_slice(&dirty);
        assert!(VolumeTable::parse(&bytes, LEB_SIZE, VID_OFFSET).is_err());
    }

    #[test]
    fn test_short_table() -> anyhow::Result<()> {
        let bytes = table_bytes(vec![None, Some(record("fip"))]);

        // A 2 KiB LEB has room for 11 records
        let size = VolumeTable::read_size(LEB_SIZE);
        assert_eq!(size, 11 * VTBL_RECORD_SIZE);
        assert_eq!(VolumeTable::read_size(1 << 20), VolumeTable::BYTES);

        let table = VolumeTable::parse(&bytes[..size], LEB_SIZE, VID_OFFSET)?;
        assert_eq!(table.find("fip"), Some(1));
        assert_eq!(table.get(VOL_IDS - 1), None);

        assert!(VolumeTable::parse(&bytes[..VTBL_RECORD_SIZE - 1], LEB_SIZE, VID_OFFSET).is_err());
        Ok(())
    }

    #[test]
    fn test_state() {
        assert!(matches!(VtblState::Absent.get(), Ok(None)));
        assert!(VtblState::Invalid("x".into()).get().is_err());
        assert!(!VtblState::Invalid("x".into()).is_valid());
    }
}
