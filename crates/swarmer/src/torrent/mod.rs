//! A torrent download: the tracker, the pool of peer connections, the
//! piece manager and the disk writer.
//!
//! [`TorrentClient::run`] announces to the tracker, connects to the peers it
//! returned and returns once every piece is verified and written to disk.
//! Peers receive [`PeerBrMsg`] from the torrent through a broadcast channel.
//! Announces run in their own task, a slow tracker never holds the download
//! back. [`TorrentMsg::Quit`] stops the download early.
mod types;

// re-exports
pub use types::*;

use std::{future::pending, path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    select, spawn,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{interval, interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    disk::{Disk, DiskMsg},
    error::Error,
    metainfo::{Info, MetaInfo},
    peer::{Peer, PeerId},
    piece_manager::{PieceManager, PieceManagerOptions},
    pool::PeerPool,
    tracker::{
        event::Event, AnnounceParams, AnnounceResponse, Tracker, TrackerTrait,
    },
    utils::{percentage, to_human_readable},
};

/// Capacity of the broadcast channel from the torrent to its peers.
const PEER_BR_CAPACITY: usize = 256;

/// State shared by the torrent and all of its peers.
#[derive(Debug)]
pub struct TorrentCtx {
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub piece_manager: PieceManager,
    pub peer_br_tx: broadcast::Sender<PeerBrMsg>,
    pub config: Arc<Config>,
}

impl TorrentCtx {
    pub fn new(
        info: &Info,
        local_peer_id: PeerId,
        config: Arc<Config>,
        options: PieceManagerOptions,
        disk_tx: mpsc::UnboundedSender<DiskMsg>,
    ) -> Self {
        let (peer_br_tx, _) = broadcast::channel(PEER_BR_CAPACITY);
        let piece_manager =
            PieceManager::new(info, options, disk_tx, peer_br_tx.clone());

        Self {
            info_hash: info.info_hash.clone(),
            local_peer_id,
            piece_manager,
            peer_br_tx,
            config,
        }
    }
}

/// Downloads one single-file torrent.
///
/// The generic `T` is the tracker, [`Tracker`] in production.
pub struct TorrentClient<T: TrackerTrait> {
    pub ctx: Arc<TorrentCtx>,
    pub info: Info,
    /// Stats of the torrent, returned by the tracker on every announce.
    pub stats: Stats,
    tracker: Arc<Mutex<T>>,
    /// The announce in flight, at most one at a time.
    announcing: Option<JoinHandle<Result<AnnounceResponse, Error>>>,
    config: Arc<Config>,
    pool: PeerPool,
    tx: mpsc::Sender<TorrentMsg>,
    rx: mpsc::Receiver<TorrentMsg>,
    disk_tx: mpsc::UnboundedSender<DiskMsg>,
    disk_rx: Option<mpsc::UnboundedReceiver<DiskMsg>>,
}

impl TorrentClient<Tracker> {
    /// Download the torrent of `meta_info` using its announce urls.
    pub fn from_metainfo(meta_info: MetaInfo, config: Config) -> Self {
        let tracker = Tracker::from_metainfo(&meta_info);
        Self::new(meta_info.info, tracker, config)
    }
}

impl<T: TrackerTrait + 'static> TorrentClient<T> {
    pub fn new(info: Info, tracker: T, config: Config) -> Self {
        let options = PieceManagerOptions::from(&config);
        Self::with_options(info, tracker, config, options)
    }

    pub fn with_options(
        info: Info,
        tracker: T,
        config: Config,
        options: PieceManagerOptions,
    ) -> Self {
        let config = Arc::new(config);
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::channel::<TorrentMsg>(8);

        let ctx = Arc::new(TorrentCtx::new(
            &info,
            PeerId::generate(),
            config.clone(),
            options,
            disk_tx.clone(),
        ));

        Self {
            ctx,
            info,
            stats: Stats::default(),
            tracker: Arc::new(Mutex::new(tracker)),
            announcing: None,
            pool: PeerPool::new(config.max_peers),
            config,
            tx,
            rx,
            disk_tx,
            disk_rx: Some(disk_rx),
        }
    }

    /// Where the downloaded file is written.
    pub fn output_path(&self) -> PathBuf {
        self.config.download_dir.join(&self.info.name)
    }

    /// Sender to control the torrent while [`TorrentClient::run`] is running.
    pub fn tx(&self) -> mpsc::Sender<TorrentMsg> {
        self.tx.clone()
    }

    /// Download the whole file. Returns Ok once every piece is verified and
    /// flushed to disk.
    #[tracing::instrument(skip_all, name = "torrent", fields(name = %self.info.name))]
    pub async fn run(mut self) -> Result<(), Error> {
        let disk_rx = self.disk_rx.take().ok_or(Error::DiskStopped)?;

        info!(
            "downloading {} ({}) in {} pieces",
            self.info.name,
            to_human_readable(self.info.get_torrent_size() as u64),
            self.info.pieces()
        );

        self.announcing = Some(self.spawn_announce(Event::Started));

        let res = select! {
            r = join_announce(&mut self.announcing) => r,
            Some(TorrentMsg::Quit) = self.rx.recv() => {
                info!("stopped before the tracker answered");
                self.stop_announcing().await;
                return Err(Error::Cancelled);
            }
        };

        let res = res.map_err(|e| {
            error!("could not announce to any tracker: {e}");
            e
        })?;
        self.stats = Stats::from(&res);

        if res.peers.is_empty() {
            error!("the tracker did not return any peer");
            self.announce_best_effort(Event::Stopped).await;
            return Err(Error::NoPeers);
        }

        self.pool.extend(res.peers);

        let announce_every = if res.interval == 0 {
            self.config.default_announce_interval()
        } else {
            Duration::from_secs(res.interval.into())
        };

        let disk = Disk::new(&self.config.download_dir, &self.info, disk_rx);
        let mut disk_handle = spawn(disk.run());

        let result = self.download(&mut disk_handle, announce_every).await;

        self.stop_announcing().await;

        // peers release their blocks and close
        let _ = self.ctx.peer_br_tx.send(PeerBrMsg::Quit);

        match &result {
            Ok(()) => self.announce_best_effort(Event::Completed).await,
            Err(Error::Cancelled) => {
                info!("download stopped");
                self.announce_best_effort(Event::Stopped).await;
            }
            Err(e) => {
                error!("download failed: {e}");
                self.announce_best_effort(Event::Stopped).await;
            }
        }

        self.pool.shutdown(self.config.shutdown_grace()).await;
        self.ctx.piece_manager.release_everything();

        if matches!(result, Err(Error::DiskStopped)) {
            return result;
        }

        // every write was sent before this, the disk handles them in order
        let _ = self.disk_tx.send(DiskMsg::Quit);

        match disk_handle.await {
            Ok(Ok(written)) => debug!("disk wrote {written} pieces"),
            Ok(Err(e)) => return Err(e),
            Err(e) => {
                error!("disk task failed: {e}");
                return Err(Error::DiskStopped);
            }
        }

        if result.is_ok() {
            info!("downloaded {:?}", self.output_path());
        }

        result
    }

    /// The event loop, returns when the download is complete or when it
    /// can't go on.
    async fn download(
        &mut self,
        disk_handle: &mut JoinHandle<Result<usize, Error>>,
        announce_every: Duration,
    ) -> Result<(), Error> {
        let mut announce_interval =
            interval_at(Instant::now() + announce_every, announce_every);
        announce_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sweep_interval = interval(Duration::from_secs(1));
        let mut peer_br_rx = self.ctx.peer_br_tx.subscribe();
        let mut last_verified = 0;

        self.fill();

        loop {
            if self.ctx.piece_manager.is_complete() {
                return Ok(());
            }

            // every known peer was tried, ask the tracker for new ones
            if self.pool.is_idle() && self.announcing.is_none() {
                info!("every known peer was tried, announcing again");
                self.announcing = Some(self.spawn_announce(Event::None));
            }

            select! {
                Some((addr, r)) = self.pool.join_next() => {
                    match r {
                        Ok(()) => debug!("{addr} closed"),
                        Err(e) => debug!("{addr} closed with error: {e}"),
                    }
                    self.fill();
                }
                _ = announce_interval.tick() => {
                    if self.announcing.is_none() {
                        self.announcing =
                            Some(self.spawn_announce(Event::None));
                    } else {
                        debug!("skipping announce, the last one is pending");
                    }
                }
                r = join_announce(&mut self.announcing) => {
                    match r {
                        Ok(res) => {
                            self.stats = Stats::from(&res);
                            let added = self.pool.extend(res.peers);
                            debug!("tracker returned {added} new peers");
                            self.fill();
                        }
                        Err(e) => warn!("announce failed: {e}"),
                    }

                    if self.pool.is_idle() {
                        let progress = self.ctx.piece_manager.progress();
                        return Err(Error::PeersExhausted {
                            verified: progress.verified,
                            total: progress.total,
                        });
                    }
                }
                _ = sweep_interval.tick() => {
                    let expired = self
                        .ctx
                        .piece_manager
                        .expire_requests(
                            Instant::now(),
                            self.config.request_timeout() * 2,
                        );
                    if !expired.is_empty() {
                        debug!("expired {} stale requests", expired.len());
                    }

                    let progress = self.ctx.piece_manager.progress();
                    if progress.verified != last_verified {
                        last_verified = progress.verified;
                        info!(
                            "{}/{} pieces, {} ({:.1}%), {} peers",
                            progress.verified,
                            progress.total,
                            to_human_readable(progress.downloaded),
                            percentage(progress.verified, progress.total),
                            self.pool.running(),
                        );
                    }
                }
                msg = peer_br_rx.recv() => {
                    match msg {
                        Ok(PeerBrMsg::HavePiece(index)) => {
                            debug!("piece {index} verified");
                        }
                        // the ctx keeps a sender alive, it never closes
                        Ok(PeerBrMsg::Quit) | Err(_) => {}
                    }
                }
                Some(TorrentMsg::Quit) = self.rx.recv() => {
                    info!("quitting");
                    return Err(Error::Cancelled);
                }
                r = &mut *disk_handle => {
                    match r {
                        Ok(Err(e)) => error!("disk failed: {e}"),
                        Ok(Ok(_)) => error!("disk stopped"),
                        Err(e) => error!("disk task failed: {e}"),
                    }
                    return Err(Error::DiskStopped);
                }
            }
        }
    }

    /// Spawn connections for the queued peers, while there are free slots.
    fn fill(&mut self) -> usize {
        let ctx = self.ctx.clone();
        self.pool.fill(move |addr| {
            let ctx = ctx.clone();
            async move {
                let mut peer = Peer::new(addr, ctx);
                peer.run().await
            }
        })
    }

    fn announce_params(&self, event: Event) -> AnnounceParams {
        let progress = self.ctx.piece_manager.progress();

        AnnounceParams {
            info_hash: self.ctx.info_hash.clone(),
            peer_id: self.ctx.local_peer_id.clone(),
            port: self.config.listen_port,
            uploaded: 0,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
        }
    }

    fn spawn_announce(
        &self,
        event: Event,
    ) -> JoinHandle<Result<AnnounceResponse, Error>> {
        spawn(announce(self.tracker.clone(), self.announce_params(event)))
    }

    /// Abort the announce in flight, if any, and wait until it lets go of
    /// the tracker.
    async fn stop_announcing(&mut self) {
        if let Some(handle) = self.announcing.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// The last announce of the torrent, the tracker has
    /// [`Config::shutdown_grace`] to answer.
    async fn announce_best_effort(&mut self, event: Event) {
        let params = self.announce_params(event);
        let grace = self.config.shutdown_grace();

        match timeout(grace, announce(self.tracker.clone(), params)).await {
            Ok(Ok(res)) => self.stats = Stats::from(&res),
            Ok(Err(e)) => debug!("could not announce {event:?}: {e}"),
            Err(_) => debug!("tracker did not answer {event:?} in {grace:?}"),
        }
    }
}

async fn announce<T: TrackerTrait>(
    tracker: Arc<Mutex<T>>,
    params: AnnounceParams,
) -> Result<AnnounceResponse, Error> {
    let event = params.event;
    let res = tracker.lock().await.announce(params).await?;

    debug!(
        "announced {event:?}: {} peers, {} seeders, {} leechers",
        res.peers.len(),
        res.seeders,
        res.leechers,
    );

    Ok(res)
}

/// Resolves with the result of the announce in flight. Never resolves when
/// there is none.
async fn join_announce(
    handle: &mut Option<JoinHandle<Result<AnnounceResponse, Error>>>,
) -> Result<AnnounceResponse, Error> {
    let Some(task) = handle.as_mut() else {
        return pending().await;
    };

    let res = match task.await {
        Ok(r) => r,
        Err(e) => {
            error!("announce task failed: {e}");
            Err(Error::TrackerResponse)
        }
    };
    *handle = None;

    res
}
