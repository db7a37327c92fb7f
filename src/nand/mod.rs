//! Abstractions and code to access NAND flash

use std::io::Read;
use std::str::FromStr;

use anyhow::ensure;

use crate::ubi::{PebIo, ReadStatus};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one erase block
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Like [NandBlock::read], but also report whether ECC had to correct the data
    fn read_ecc(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<ReadStatus> {
        self.read(start_page, content)?;
        Ok(ReadStatus::Clean)
    }
}

/// A simulated in-memory NAND flash, for testing purposes and for attaching to image files
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            block.erase();
            read.read_exact(&mut buf)?;
            block.program(0, &buf)?;
        }

        Ok(())
    }

    /// Get mutable access to a block for preparing its content, even if it is marked bad
    pub fn raw_block(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `start_page` must be greater than any previously-written page, as on real NAND.
    pub fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    /// Erase the block, making all pages writable again
    pub fn erase(&mut self) {
        self.data.clear();
    }

    /// Mark the block bad; it will no longer be returned by [Nand::block]
    pub fn mark_bad(&mut self) {
        self.erase();
        self.marked_bad = true;
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }
}

/// Exposes a page-granular [Nand] through the byte-granular [PebIo] interface the UBI attach
/// code consumes. PEB numbers map 1:1 onto NAND blocks.
#[derive(Debug)]
pub struct NandPebIo<N> {
    nand: N,
    page_buf: Vec<u8>,
}

impl<N: Nand> NandPebIo<N> {
    pub fn new(nand: N) -> Self {
        Self {
            nand,
            page_buf: Vec::new(),
        }
    }

    /// Get the wrapped NAND back
    pub fn into_inner(self) -> N {
        self.nand
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }
}

impl<N: Nand> PebIo for NandPebIo<N> {
    fn read(&mut self, pnum: u32, offset: u32, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        let layout = self.nand.get_layout();
        let page_size = layout.bytes_per_page;
        let offset = offset as usize;
        ensure!(
            offset + buf.len() <= layout.block_size(),
            "read of {} bytes at {offset} crosses the end of block {pnum}",
            buf.len()
        );
        if buf.is_empty() {
            return Ok(ReadStatus::Clean);
        }

        // Widen the request to whole pages
        let first_page = offset / page_size;
        let end_page = (offset + buf.len()).div_ceil(page_size);
        self.page_buf.resize((end_page - first_page) * page_size, 0);

        let block = self
            .nand
            .block(pnum)?
            .ok_or(anyhow::anyhow!("block {pnum} is marked bad"))?;
        let status = block.read_ecc(first_page as u32, &mut self.page_buf)?;

        let skip = offset - first_page * page_size;
        buf.copy_from_slice(&self.page_buf[skip..][..buf.len()]);
        Ok(status)
    }

    fn is_bad_peb(&mut self, pnum: u32) -> bool {
        // A block that cannot even be looked up is no better than a bad one
        !matches!(self.nand.block(pnum), Ok(Some(_)))
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.raw_block(0).unwrap().mark_bad();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let block = nand.raw_block(0).unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    let block = nand.block(0).unwrap().unwrap();
    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}

#[test]
fn test_layout_from_str() {
    let layout: NandLayout = "64x6x512".parse().unwrap();
    assert_eq!(
        layout,
        NandLayout {
            blocks: 64,
            pages_per_block: 6,
            bytes_per_page: 512,
        }
    );
    assert!("64x6".parse::<NandLayout>().is_err());
    assert!("axbxc".parse::<NandLayout>().is_err());
}

#[test]
fn test_peb_io_unaligned_read() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let content: Vec<u8> = (0..TEST_LAYOUT.block_size()).map(|i| i as u8).collect();
    nand.raw_block(3)?.program(0, &content)?;
    nand.raw_block(5)?.mark_bad();

    let mut io = NandPebIo::new(nand);

    // A read straddling a page boundary
    let mut buf = [0u8; 20];
    assert_eq!(io.read(3, 250, &mut buf)?, ReadStatus::Clean);
    assert_eq!(buf[..], content[250..270]);

    // Reads past the block end are refused
    assert!(io.read(3, TEST_LAYOUT.block_size() as u32 - 4, &mut buf).is_err());

    assert!(!io.is_bad_peb(3));
    assert!(io.is_bad_peb(5));
    assert!(io.read(5, 0, &mut buf).is_err());

    // Out of range counts as bad
    assert!(io.is_bad_peb(TEST_LAYOUT.blocks));
    Ok(())
}
