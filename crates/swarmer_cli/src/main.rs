mod args;
mod error;

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use swarmer::{
    config::Config,
    metainfo::MetaInfo,
    torrent::{TorrentClient, TorrentMsg},
};
use tokio::{select, signal};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use args::Args;
use error::Error;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // the guard flushes the log file when dropped
    let _guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(path) => {
            info!("download complete: {path:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<PathBuf, Error> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => {
            let path = Config::config_path()?;
            if Config::write_default(&path).await? {
                info!("wrote the default configuration to {path:?}");
            }
            path
        }
    };

    let mut config = Config::load(Some(&config_path))?;
    args.apply(&mut config);
    debug!("{config:#?}");

    let meta_info = MetaInfo::from_path(&args.torrent).await?;

    let client = TorrentClient::from_metainfo(meta_info, config);
    let path = client.output_path();
    let tx = client.tx();

    let run = client.run();
    tokio::pin!(run);

    // on ctrl-c the torrent announces Stopped and flushes the disk before
    // returning
    select! {
        r = &mut run => r?,
        r = signal::ctrl_c() => {
            if let Err(e) = r {
                warn!("could not listen for ctrl-c: {e}");
            } else {
                info!("ctrl-c received, stopping");
                let _ = tx.send(TorrentMsg::Quit).await;
            }
            run.await?;
        }
    }

    Ok(path)
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>, Error> {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,swarmer={level},swarmer_cli={level}"))
    });

    let Some(log_file) = &args.log_file else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| Error::LogFile(log_file.clone(), e))?;

    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(Some(guard))
}
