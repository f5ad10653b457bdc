use std::path::PathBuf;

use clap::{ArgAction, Parser};
use swarmer::{config::Config, piece_manager::PieceStrategy};

#[derive(Parser, Debug)]
#[command(name = "swarm", author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Path of the .torrent file to download.
    pub torrent: PathBuf,

    /// The directory in which the file will be downloaded.
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Port announced to the tracker.
    #[clap(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peers downloading at the same time.
    #[clap(long)]
    pub max_peers: Option<usize>,

    /// Order in which new pieces are picked: sequential, rarest or random.
    #[clap(long)]
    pub strategy: Option<PieceStrategy>,

    /// Configuration file, the default is in the config dir of the
    /// platform, `~/.config/swarmer/config.toml` on Linux.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// More logs, can be repeated: -v for debug and -vv for trace.
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Write the logs to this file instead of stderr.
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Flags take precedence over the configuration file and the
    /// environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers.max(1);
        }
        if let Some(strategy) = self.strategy {
            config.piece_strategy = strategy;
        }
    }

    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "swarm",
            "file.torrent",
            "-d",
            "/tmp/out",
            "-p",
            "7000",
            "--max-peers",
            "4",
            "--strategy",
            "rarest",
            "-vv",
        ]);

        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.download_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.max_peers, 4);
        assert_eq!(config.piece_strategy, PieceStrategy::RarestFirst);
        assert_eq!(args.log_level(), "trace");
    }

    #[test]
    fn defaults_are_kept() {
        let args = Args::parse_from(["swarm", "file.torrent"]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config, Config::default());
        assert_eq!(args.log_level(), "info");
        assert!(Args::try_parse_from(["swarm", "f", "--strategy", "x"]).is_err());
    }
}
