#![forbid(unsafe_code)]
//! `peek`: explore ext4 images without mounting them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pfs_block::FileByteDevice;
use pfs_fs::{Filesystem, InodeKind};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "peek", about = "Read-only ext4 image explorer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show superblock geometry and identity.
    Inspect {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List a directory inside the image.
    Ls {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Directory path inside the image.
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show metadata for one path inside the image.
    Stat {
        /// Path to the filesystem image.
        image: PathBuf,
        /// Path inside the image.
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Write a file's contents to stdout.
    Cat {
        /// Path to the filesystem image.
        image: PathBuf,
        /// File path inside the image.
        path: String,
    },
}

fn open_filesystem(image: &PathBuf) -> Result<Filesystem<FileByteDevice>> {
    let dev = FileByteDevice::open(image)
        .with_context(|| format!("failed to open image {}", image.display()))?;
    Filesystem::new(dev).with_context(|| format!("failed to mount {}", image.display()))
}

fn kind_label(kind: InodeKind) -> &'static str {
    match kind {
        InodeKind::Regular => "file",
        InodeKind::Directory => "dir",
        InodeKind::Symlink => "link",
        InodeKind::Other => "other",
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { image, json } => {
            let fs = open_filesystem(&image)?;
            let sb = fs.superblock();
            if json {
                println!("{}", serde_json::to_string_pretty(sb)?);
            } else {
                println!("volume:           {}", sb.volume_name);
                println!("block size:       {}", sb.block_size);
                println!("blocks:           {}", sb.blocks_count);
                println!("inodes:           {}", sb.inodes_count);
                println!("blocks per group: {}", sb.blocks_per_group);
                println!("inodes per group: {}", sb.inodes_per_group);
                println!("inode size:       {}", sb.inode_size);
                println!("64-bit:           {}", sb.is_64bit());
                println!("feature_incompat: {:#x}", sb.feature_incompat);
            }
        }
        Command::Ls { image, path } => {
            let fs = open_filesystem(&image)?;
            for entry in fs
                .read_dir(&path)
                .with_context(|| format!("failed to list {path}"))?
            {
                let info = entry
                    .info()
                    .with_context(|| format!("failed to stat {}", entry.name()))?;
                println!(
                    "{:<5} {:>12} {}",
                    kind_label(info.kind),
                    info.size,
                    entry.name()
                );
            }
        }
        Command::Stat { image, path, json } => {
            let fs = open_filesystem(&image)?;
            let info = fs
                .stat(&path)
                .with_context(|| format!("failed to stat {path}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("name:  {}", info.name);
                println!("inode: {}", info.ino);
                println!("kind:  {}", kind_label(info.kind));
                println!("size:  {}", info.size);
                println!("mode:  {:o}", info.mode);
                println!("mtime: {}", info.mtime);
            }
        }
        Command::Cat { image, path } => {
            let fs = open_filesystem(&image)?;
            let mut file = fs
                .open(&path)
                .with_context(|| format!("failed to open {path}"))?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let mut buf = vec![0_u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).with_context(|| format!("failed to read {path}"))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
            out.flush()?;
        }
    }

    Ok(())
}
