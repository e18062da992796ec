use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use ota_core::cert::{hex_dump, to_hex, PinnedKey};
use ota_core::metadata::{FilePath, Metadata, MAX_FILE_PATH};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "ota-publish")]
#[command(about = "Prepare firmware images and metadata for the HTTPS OTA server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the metadata file announcing a firmware version
    Metadata {
        /// Firmware version number (VERSION=)
        #[arg(long)]
        version: u32,
        /// Server path of the image (FILE=)
        #[arg(short, long)]
        file: String,
        /// Polling interval for devices in seconds, 0 disables polling (INTERVAL=)
        #[arg(short, long)]
        interval: Option<u32>,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the public key devices pin for a server certificate
    Pin {
        /// PEM encoded server certificate
        #[arg(short, long)]
        cert: PathBuf,
    },
    /// Size and SHA-256 of a firmware image
    Digest {
        #[arg(short, long)]
        firmware: PathBuf,
    },
    /// Copy an image into a server directory and write its metadata next to it
    Release {
        /// Firmware image (.bin)
        #[arg(long)]
        firmware: PathBuf,
        #[arg(long)]
        version: u32,
        /// Document root of the update server
        #[arg(short, long)]
        root: PathBuf,
        /// Directory below the root for images
        #[arg(long, default_value = "/fw")]
        image_dir: String,
        /// Metadata path below the root
        #[arg(short, long, default_value = "/ota.txt")]
        metadata: String,
        #[arg(short, long)]
        interval: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Metadata { version, file, interval, output } => {
            let metadata = build_metadata(version, &file, interval)?;
            match output {
                Some(path) => {
                    fs::write(&path, metadata.render())
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{} Metadata written to {}", "✓".green(), path.display());
                }
                None => print!("{}", metadata.render()),
            }
        }
        Command::Pin { cert } => pin(&cert)?,
        Command::Digest { firmware } => {
            let (size, digest) = digest(&firmware)?;
            println!("{} {}", "File:".dimmed(), firmware.display());
            println!("{} {} bytes ({:.2} MB)", "Size:".dimmed(), size, size as f64 / 1024.0 / 1024.0);
            println!("{} {}", "SHA-256:".dimmed(), digest);
        }
        Command::Release { firmware, version, root, image_dir, metadata, interval } => {
            release(&firmware, version, &root, &image_dir, &metadata, interval)?;
        }
    }
    Ok(())
}

fn build_metadata(version: u32, file: &str, interval: Option<u32>) -> Result<Metadata> {
    if !file.starts_with('/') {
        bail!("image path must start with '/': {}", file);
    }
    if file.chars().any(|c| c.is_whitespace()) {
        bail!("image path must not contain whitespace: {}", file);
    }
    let mut path = FilePath::new();
    if path.push_str(file).is_err() {
        bail!("image path longer than {} bytes", MAX_FILE_PATH);
    }
    Ok(Metadata { interval_seconds: interval, version: Some(version), file: Some(path) })
}

fn pin(cert: &Path) -> Result<()> {
    let pem = fs::read_to_string(cert).with_context(|| format!("reading {}", cert.display()))?;
    let key = PinnedKey::from_pem(&pem)?;

    println!("{} Pinned public key of {} ({} bytes)", "🔑".blue(), cert.display(), key.as_der().len());
    for line in hex_dump(key.as_der()) {
        println!("   {}", line);
    }
    println!("{} {}", "SHA-256:".dimmed(), key.fingerprint());
    Ok(())
}

fn digest(firmware: &Path) -> Result<(u64, String)> {
    let mut file = fs::File::open(firmware).with_context(|| format!("opening {}", firmware.display()))?;
    let size = file.metadata()?.len();

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        pb.inc(n as u64);
    }
    pb.finish_and_clear();

    Ok((size, to_hex(&hasher.finalize())))
}

fn release(
    firmware: &Path,
    version: u32,
    root: &Path,
    image_dir: &str,
    metadata_path: &str,
    interval: Option<u32>,
) -> Result<()> {
    if !firmware.exists() {
        bail!("firmware not found: {}", firmware.display());
    }
    let (size, sha) = digest(firmware)?;
    if size == 0 {
        bail!("firmware image is empty");
    }

    let server_path = format!("{}/v{}.bin", image_dir.trim_end_matches('/'), version);
    let metadata = build_metadata(version, &server_path, interval)?;

    let image_target = root.join(server_path.trim_start_matches('/'));
    if let Some(dir) = image_target.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::copy(firmware, &image_target).with_context(|| format!("copying to {}", image_target.display()))?;

    let metadata_target = root.join(metadata_path.trim_start_matches('/'));
    if let Some(dir) = metadata_target.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&metadata_target, metadata.render())?;

    println!("{} Released firmware version {}", "🚀".blue(), version);
    println!("{}Image: {} ({} bytes)", "   ".dimmed(), image_target.display(), size);
    println!("{}SHA-256: {}", "   ".dimmed(), sha);
    println!("{}Metadata: {}", "   ".dimmed(), metadata_target.display());
    Ok(())
}
