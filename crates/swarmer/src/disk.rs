//! Disk is responsible for the file I/O of the torrent, it writes the
//! verified pieces at their offset of the output file.
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info};

use crate::{error::Error, metainfo::Info};

#[derive(Debug)]
pub enum DiskMsg {
    /// A verified piece, the buffer is owned by the Disk from now on.
    WritePiece { index: usize, bytes: Vec<u8> },
    /// Flush the file and stop, after every previous write.
    Quit,
}

/// Writes pieces of a single-file torrent into `<download_dir>/<name>`.
#[derive(Debug)]
pub struct Disk {
    path: PathBuf,
    piece_length: u64,
    total_size: u64,
    rx: mpsc::UnboundedReceiver<DiskMsg>,
}

impl Disk {
    pub fn new(
        download_dir: impl AsRef<Path>,
        info: &Info,
        rx: mpsc::UnboundedReceiver<DiskMsg>,
    ) -> Self {
        Self {
            path: download_dir.as_ref().join(&info.name),
            piece_length: info.piece_length as u64,
            total_size: info.get_torrent_size() as u64,
            rx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file, creating it and its directory if needed. The file is
    /// resized to the length of the torrent.
    pub async fn open_file(path: &Path, len: u64) -> Result<File, Error> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        file.set_len(len).await?;

        Ok(file)
    }

    /// Run until [`DiskMsg::Quit`] or until every sender is dropped.
    /// Returns how many pieces were written.
    #[tracing::instrument(skip(self), name = "disk::run", fields(path = ?self.path))]
    pub async fn run(mut self) -> Result<usize, Error> {
        let mut file = Self::open_file(&self.path, self.total_size).await?;
        let mut written = 0;

        debug!("disk started event loop");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                DiskMsg::WritePiece { index, bytes } => {
                    let offset = index as u64 * self.piece_length;
                    debug!("writing piece {index} at {offset}");

                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&bytes).await?;
                    written += 1;
                }
                DiskMsg::Quit => {
                    debug!("quit");
                    break;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        info!("wrote {written} pieces to {:?}", self.path);

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;

    fn temp_dir() -> PathBuf {
        let name: String = rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(format!("swarmer-disk-{name}"))
    }

    #[tokio::test]
    async fn writes_pieces_at_their_offset() -> Result<(), Error> {
        let dir = temp_dir();
        let data = b"abcdefghijklmn";
        let info = Info::new("out.bin", 14, 4, vec![0; 80])?;

        let (tx, rx) = mpsc::unbounded_channel();
        let disk = Disk::new(&dir, &info, rx);
        let path = disk.path().to_path_buf();
        let handle = tokio::spawn(disk.run());

        // out of order, the last piece is shorter
        for index in [3usize, 1, 0, 2] {
            let start = index * 4;
            let end = (start + 4).min(14);
            tx.send(DiskMsg::WritePiece {
                index,
                bytes: data[start..end].to_vec(),
            })
            .unwrap();
        }
        tx.send(DiskMsg::Quit).unwrap();

        let written = handle.await.unwrap()?;
        assert_eq!(written, 4);
        assert_eq!(tokio::fs::read(&path).await?, data);

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn file_is_sized_on_open() -> Result<(), Error> {
        let dir = temp_dir();
        let path = dir.join("sized.bin");
        let file = Disk::open_file(&path, 1000).await?;
        assert_eq!(file.metadata().await?.len(), 1000);
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }
}
