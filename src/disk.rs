//! Disk collaborator interface.
//!
//! The session core never performs file I/O. It emits [`DiskRequest`]
//! values; a driver forwards them to a disk task over the [`DiskCommand`]
//! channel protocol and marshals the replies back onto the session. The
//! core observes failures only as [`DiskError`] values, which carry the
//! read/write distinction the error mode surfaces to callers.

use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::torrent::BlockRequest;
use crate::verify::PieceHash;

/// A disk failure, fatal to the torrent.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("hash failed: {0}")]
    Hash(#[source] std::io::Error),

    #[error("files missing")]
    FilesMissing,
}

impl DiskError {
    /// Whether this failure counts as a write failure for error reporting;
    /// everything else surfaces as a read failure.
    pub fn is_write(&self) -> bool {
        matches!(self, DiskError::Write(_))
    }
}

/// Plain-data disk work emitted by the session core.
///
/// Carries no reply channels; the driver attaches those when forwarding as
/// [`DiskCommand`]s and feeds results back through the session's
/// `on_*` entry points together with the generation the work was issued
/// under.
#[derive(Debug)]
pub enum DiskRequest {
    /// Read a block to serve an upload to `peer`.
    ReadBlock {
        peer: SocketAddr,
        request: BlockRequest,
    },
    /// Persist a verified piece's block.
    WriteBlock {
        piece: u32,
        offset: u32,
        data: Bytes,
    },
    /// Hash an on-disk piece (hash-check phase).
    HashPiece { piece: u32 },
    /// Release file handles (stopping).
    CloseFiles,
    /// Probe whether the torrent's files exist on disk (starting).
    CheckFilesExist,
}

/// The channel protocol a disk task implements.
#[derive(Debug)]
pub enum DiskCommand {
    ReadBlock {
        piece: u32,
        offset: u32,
        length: u32,
        reply: oneshot::Sender<Result<Bytes, DiskError>>,
    },
    WriteBlock {
        piece: u32,
        offset: u32,
        data: Bytes,
        reply: oneshot::Sender<Result<(), DiskError>>,
    },
    HashPiece {
        piece: u32,
        reply: oneshot::Sender<Result<PieceHash, DiskError>>,
    },
    CloseFiles {
        reply: oneshot::Sender<Result<(), DiskError>>,
    },
    CheckFilesExist {
        reply: oneshot::Sender<bool>,
    },
}

/// A driver-side handle to the disk task.
#[derive(Clone)]
pub struct DiskHandle {
    tx: mpsc::UnboundedSender<DiskCommand>,
}

impl DiskHandle {
    /// Creates a handle and the receiving end a disk task consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DiskCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, DiskError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DiskCommand::ReadBlock {
                piece,
                offset,
                length,
                reply,
            })
            .map_err(|_| DiskError::Read(gone()))?;
        rx.await.map_err(|_| DiskError::Read(gone()))?
    }

    pub async fn write_block(
        &self,
        piece: u32,
        offset: u32,
        data: Bytes,
    ) -> Result<(), DiskError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DiskCommand::WriteBlock {
                piece,
                offset,
                data,
                reply,
            })
            .map_err(|_| DiskError::Write(gone()))?;
        rx.await.map_err(|_| DiskError::Write(gone()))?
    }

    pub async fn hash_piece(&self, piece: u32) -> Result<PieceHash, DiskError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DiskCommand::HashPiece { piece, reply })
            .map_err(|_| DiskError::Hash(gone()))?;
        rx.await.map_err(|_| DiskError::Hash(gone()))?
    }

    pub async fn close_files(&self) -> Result<(), DiskError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DiskCommand::CloseFiles { reply })
            .map_err(|_| DiskError::Write(gone()))?;
        rx.await.map_err(|_| DiskError::Write(gone()))?
    }

    pub async fn check_files_exist(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DiskCommand::CheckFilesExist { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

fn gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "disk task gone")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_roundtrip() {
        let (handle, mut rx) = DiskHandle::channel();

        // A trivial in-memory disk task.
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    DiskCommand::ReadBlock { length, reply, .. } => {
                        let _ = reply.send(Ok(Bytes::from(vec![0xAB; length as usize])));
                    }
                    DiskCommand::WriteBlock { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    DiskCommand::HashPiece { reply, .. } => {
                        let _ = reply.send(Ok(PieceHash::Flat([0u8; 20])));
                    }
                    DiskCommand::CloseFiles { reply } => {
                        let _ = reply.send(Ok(()));
                    }
                    DiskCommand::CheckFilesExist { reply } => {
                        let _ = reply.send(true);
                    }
                }
            }
        });

        let data = handle.read_block(0, 0, 4).await.unwrap();
        assert_eq!(&data[..], &[0xAB; 4]);
        handle.write_block(0, 0, Bytes::from_static(b"x")).await.unwrap();
        assert!(matches!(
            handle.hash_piece(0).await.unwrap(),
            PieceHash::Flat(_)
        ));
        assert!(handle.check_files_exist().await);
        handle.close_files().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_survives_dead_task() {
        let (handle, rx) = DiskHandle::channel();
        drop(rx);
        assert!(handle.read_block(0, 0, 1).await.is_err());
        assert!(!handle.check_files_exist().await);
    }
}
