mod bitfield;
mod downloader;
mod error;
mod handshake;
mod message;
mod peer;
mod piece;
mod session;
mod store;
mod torrent;
mod tracker;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::info;

use crate::downloader::Downloader;
use crate::torrent::Torrent;

#[derive(Parser, Debug)]
#[command(version, about = "Minimal BitTorrent download client")]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory where the downloaded files are written
    #[arg(short = 'd', long, default_value = ".")]
    download_dir: PathBuf,
}

fn run(args: Args) -> anyhow::Result<()> {
    if !args.torrent.is_file() {
        bail!("torrent file not found: {}", args.torrent.display());
    }
    std::fs::create_dir_all(&args.download_dir)
        .with_context(|| format!("could not create {}", args.download_dir.display()))?;

    let torrent = Torrent::open(&args.torrent)?;
    println!(
        "Downloading \"{}\" ({} pieces, {} bytes)",
        torrent.name(),
        torrent.piece_count(),
        torrent.total_size()
    );

    let mut downloader = Downloader::new(torrent, &args.download_dir)?;
    downloader.start()?;

    let handle = downloader.shutdown_handle();
    ctrlc::set_handler(move || {
        handle.stop();
    })
    .context("could not install the signal handler")?;

    // 'q' followed by enter stops the download as well
    let handle = downloader.shutdown_handle();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim() == "q" => {
                    handle.stop();
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });

    while downloader.is_running() {
        thread::sleep(Duration::from_millis(200));
    }
    downloader.join();

    if downloader.is_complete() {
        info!("download finished");
    }

    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}
