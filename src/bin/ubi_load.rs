//! A front-end for the UBI loader: attach to a NAND image or MTD device, then inspect it or pull
//! volumes out of it. Nothing is ever written to the flash.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use ubi_loader::nand::mtd::MtdNand;
use ubi_loader::{
    nand::{Nand, NandLayout, NandPebIo, SimNand},
    ubi::{headers::VolType, Geometry, PebIo, UbiAttach, VolumeReader, VolumeSelector, VOL_IDS},
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                let mut file =
                    File::open(path).with_context(|| format!("opening {}", path.display()))?;
                sim.load(&mut file)?;
            }

            NandImpl::Sim(NandPebIo::new(sim))
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = if let Some(name) = &self.mtd_name {
                    MtdNand::open_named(name)?
                } else if let Some(dev) = &self.mtd_dev {
                    MtdNand::open(dev)?
                } else {
                    anyhow::bail!("no NAND given")
                };

                NandImpl::Mtd(NandPebIo::new(mtd))
            }

            #[cfg(not(target_os = "linux"))]
            anyhow::bail!("no NAND given")
        };

        Ok(nandimpl)
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(NandPebIo<SimNand>),

    #[cfg(target_os = "linux")]
    Mtd(NandPebIo<MtdNand>),
}

impl NandImpl {
    fn layout(&mut self) -> NandLayout {
        match self {
            Self::Sim(io) => io.nand_mut().get_layout(),

            #[cfg(target_os = "linux")]
            Self::Mtd(io) => io.nand_mut().get_layout(),
        }
    }

    fn peb_io(&mut self) -> &mut dyn PebIo {
        match self {
            Self::Sim(io) => io,

            #[cfg(target_os = "linux")]
            Self::Mtd(io) => io,
        }
    }
}

#[derive(Args, Debug)]
struct AttachOptions {
    /// First PEB of the UBI partition within the NAND
    #[clap(long, default_value_t = 0)]
    peb_offset: u32,

    /// Number of PEBs in the UBI partition (default: up to the end of the NAND)
    #[clap(long)]
    peb_count: Option<u32>,

    /// Always do a full scan, even if a fastmap is present
    #[clap(long)]
    no_fastmap: bool,
}

impl AttachOptions {
    fn geometry(&self, layout: NandLayout) -> Result<Geometry> {
        let geometry = Geometry::from(layout).with_peb_offset(self.peb_offset);
        let available = layout
            .blocks
            .checked_sub(self.peb_offset)
            .context("PEB offset lies beyond the end of the NAND")?;

        Ok(match self.peb_count {
            Some(count) if count > available => {
                anyhow::bail!("{count} PEBs from {} do not fit", self.peb_offset)
            }
            Some(count) => geometry.with_peb_count(count),
            None => geometry.with_peb_count(available),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the volume table
    Volumes,

    /// Print the LEB-to-PEB mapping of every tracked volume
    Map,

    /// Print the size of a volume's data, in bytes
    Size {
        /// Volume id, or name
        volume: VolumeSelector,
    },

    /// Copy (part of) a volume's data into a file
    Load {
        /// Volume id, or name
        volume: VolumeSelector,

        /// The file to write, or `-` for standard output
        output: PathBuf,

        /// Skip this many bytes at the start of the volume
        #[clap(long, default_value_t = 0)]
        offset: u64,

        /// Copy at most this many bytes
        #[clap(long)]
        length: Option<u64>,
    },
}

impl Command {
    fn execute<I: PebIo>(self, ubi: &mut UbiAttach<I>) -> Result<()> {
        match self {
            Command::Volumes => {
                let Some(table) = ubi.volume_table()? else {
                    println!("No volume table found");
                    return Ok(());
                };

                for (id, record) in table.iter() {
                    let vol_type = match record.vol_type {
                        VolType::Static => "static",
                        VolType::Dynamic => "dynamic",
                    };
                    println!(
                        "{id:4} => {:?} ({vol_type}, {} PEBs reserved, alignment {})",
                        record.name, record.reserved_pebs, record.alignment
                    );
                }
            }

            Command::Map => {
                println!(
                    "{} PEBs, attached by {}",
                    ubi.peb_count(),
                    if ubi.fastmap_attached() { "fastmap" } else { "full scan" }
                );

                for vol_id in 0..VOL_IDS {
                    let Some(last) = ubi.last_block(vol_id) else {
                        continue;
                    };

                    println!("Volume {vol_id}:");
                    for lnum in 0..=last {
                        match ubi.leb_to_peb(vol_id, lnum) {
                            Some(pnum) => println!("{lnum:6} => {pnum}"),
                            None => println!("{lnum:6} => (missing)"),
                        }
                    }
                }
            }

            Command::Size { volume } => {
                let size = ubi.retry_without_fastmap(|ubi| ubi.get_volume_size(&volume))?;
                println!("{size}");
            }

            Command::Load {
                volume,
                output,
                offset,
                length,
            } => {
                let mut reader = VolumeReader::open(ubi, volume.clone())
                    .with_context(|| format!("opening volume {volume}"))?;
                reader.seek(SeekFrom::Start(offset))?;
                let mut reader = reader.take(length.unwrap_or(u64::MAX));

                let copied = if output.as_os_str() == "-" {
                    io::copy(&mut reader, &mut io::stdout().lock())
                } else {
                    let mut file = File::create(&output)
                        .with_context(|| format!("creating {}", output.display()))?;
                    io::copy(&mut reader, &mut file)
                }
                .with_context(|| format!("loading volume {volume}"))?;

                log::info!("Copied {copied} bytes of volume {volume}");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// Where the UBI partition lies, and how to attach to it
    #[clap(flatten)]
    attach: AttachOptions,

    /// The command to run against the attached partition
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut nand = args.nand.open()?;
    let geometry = args.attach.geometry(nand.layout())?;

    let mut ubi = UbiAttach::init_scan(geometry, nand.peb_io(), !args.attach.no_fastmap)
        .context("attaching UBI")?;
    args.cmd.execute(&mut ubi)?;
    Ok(())
}
