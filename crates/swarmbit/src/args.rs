use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Arguments {
    /// Decoded torrent descriptor (JSON)
    #[arg(value_name = "DESCRIPTOR")]
    pub descriptor: PathBuf,
    /// Where to save the downloaded torrents
    #[arg(short, long, value_name = "OUTPUT_DIR", default_value = Path::new("./downloads").to_path_buf().into_os_string())]
    pub output_dir: PathBuf,
    /// Peer to connect to, can be repeated
    #[arg(long = "peer", value_name = "IP:PORT")]
    pub peers: Vec<SocketAddrV4>,
    /// Our own externally visible address, never connected to
    #[arg(long, value_name = "IP:PORT")]
    pub self_addr: Option<SocketAddrV4>,
    /// Exit as soon as the download is finished instead of seeding
    #[arg(long)]
    pub no_seed: bool,
}
