//! Turns local filesystem events into protocol requests, one at a time.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::event::{FsEvent, FsOp};
use crate::fsops::{self, Root};
use crate::protocol::{self, Tag};
use crate::session::{Applied, Request};

pub struct EventPump {
    commands: mpsc::Sender<Request>,
    root: Root,
    ack_timeout: Option<Duration>,
}

impl EventPump {
    pub fn new(commands: mpsc::Sender<Request>, root: Root, ack_timeout: Option<Duration>) -> Self {
        Self {
            commands,
            root,
            ack_timeout,
        }
    }

    /// Drains the reconciliation `backlog`, tells the peer and `initial_sync`
    /// that the initial sync is over, then follows `live` until it closes.
    pub async fn run(
        self,
        backlog: Vec<FsEvent>,
        mut live: mpsc::Receiver<FsEvent>,
        initial_sync: oneshot::Sender<()>,
    ) -> Result<(), SyncError> {
        let total = backlog.len();
        for event in backlog {
            self.apply(event).await?;
        }
        self.commands
            .send(Request::notify(Tag::InitFinished, Bytes::new()))
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;
        info!(events = total, "initial sync complete");
        let _ = initial_sync.send(());

        while let Some(event) = live.recv().await {
            self.apply(event).await?;
        }
        debug!("event queue closed");
        Ok(())
    }

    /// Sends one event and waits for the peer to acknowledge it.
    async fn apply(&self, event: FsEvent) -> Result<(), SyncError> {
        let Some((tag, payload, transfer)) = self.translate(&event).await else {
            return Ok(());
        };
        let (applied, outcome) = oneshot::channel();
        debug!(?tag, path = %event.path.display(), "dispatching event");
        self.commands
            .send(Request {
                tag,
                payload,
                transfer,
                applied: Some(applied),
            })
            .await
            .map_err(|_| SyncError::ConnectionClosed)?;

        match self.wait(outcome).await? {
            Ok(()) => debug!(?tag, path = %event.path.display(), "applied"),
            Err(reason) => warn!(?tag, path = %event.path.display(), %reason, "peer could not apply event"),
        }
        Ok(())
    }

    async fn wait(&self, outcome: oneshot::Receiver<Applied>) -> Result<Applied, SyncError> {
        let received = match self.ack_timeout {
            Some(limit) => tokio::time::timeout(limit, outcome)
                .await
                .map_err(|_| SyncError::AckTimeout(limit.as_secs()))?,
            None => outcome.await,
        };
        received.map_err(|_| SyncError::ConnectionClosed)
    }

    async fn translate(&self, event: &FsEvent) -> Option<(Tag, Bytes, Option<PathBuf>)> {
        let Some(relative) = self.root.relative(&event.path) else {
            warn!(path = %event.path.display(), "event outside the sync root");
            return None;
        };
        let translated = match event.op {
            FsOp::Fetch => {
                if fsops::exists(&event.path).await && !fsops::is_directory(&event.path).await {
                    match fsops::content_hash(&event.path).await {
                        Ok(digest) => (
                            Tag::SyncFileNotEmpty,
                            protocol::encode_probe(&digest, &relative),
                            None,
                        ),
                        Err(e) => {
                            warn!(path = %event.path.display(), "cannot hash: {e}");
                            return None;
                        }
                    }
                } else {
                    (
                        Tag::SyncFileEmpty,
                        Bytes::from(relative),
                        Some(event.path.clone()),
                    )
                }
            }
            FsOp::Create => (Tag::OpCreate, Bytes::from(relative), None),
            FsOp::Modify => (
                Tag::OpModify,
                Bytes::from(relative),
                Some(event.path.clone()),
            ),
            FsOp::Remove => (Tag::OpRemove, Bytes::from(relative), None),
            FsOp::Mkdir => (Tag::OpMkdir, Bytes::from(relative), None),
            FsOp::Rename => {
                let origin = event
                    .origin_path
                    .as_deref()
                    .and_then(|origin| self.root.relative(origin));
                let Some(origin) = origin else {
                    warn!(path = %event.path.display(), "rename without a usable origin");
                    return None;
                };
                (
                    Tag::OpRename,
                    protocol::encode_rename(&relative, &origin),
                    None,
                )
            }
        };
        Some(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump() -> (tempfile::TempDir, Root, EventPump, mpsc::Receiver<Request>) {
        let dir = tempfile::tempdir().unwrap();
        let root = Root::open(dir.path()).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let pump = EventPump::new(tx, root.clone(), Some(Duration::from_millis(200)));
        (dir, root, pump, rx)
    }

    #[tokio::test]
    async fn fetch_depends_on_local_presence() {
        let (_dir, root, pump, _rx) = pump();
        let missing = root.path().join("missing.txt");
        let (tag, payload, transfer) = pump
            .translate(&FsEvent::new(FsOp::Fetch, &missing))
            .await
            .unwrap();
        assert_eq!(tag, Tag::SyncFileEmpty);
        assert_eq!(&payload[..], b"missing.txt");
        assert_eq!(transfer, Some(missing));

        let present = root.path().join("present.txt");
        std::fs::write(&present, b"data").unwrap();
        let (tag, payload, transfer) = pump
            .translate(&FsEvent::new(FsOp::Fetch, &present))
            .await
            .unwrap();
        assert_eq!(tag, Tag::SyncFileNotEmpty);
        let (digest, path) = protocol::decode_probe(&payload).unwrap();
        assert_eq!(digest, crate::rsync::strong_hash(b"data"));
        assert_eq!(path, "present.txt");
        assert_eq!(transfer, None);
    }

    #[tokio::test]
    async fn rename_carries_both_paths() {
        let (_dir, root, pump, _rx) = pump();
        let event = FsEvent::rename(root.path().join("old/name.txt"), root.path().join("new/name.txt"));
        let (tag, payload, _) = pump.translate(&event).await.unwrap();
        assert_eq!(tag, Tag::OpRename);
        assert_eq!(
            protocol::decode_rename(&payload).unwrap(),
            ("new/name.txt".to_string(), "old/name.txt".to_string())
        );
    }

    #[tokio::test]
    async fn events_outside_root_are_skipped() {
        let (_dir, _root, pump, _rx) = pump();
        let event = FsEvent::new(FsOp::Create, "/definitely/not/here");
        assert!(pump.translate(&event).await.is_none());
    }

    #[tokio::test]
    async fn waits_for_each_acknowledgement_in_turn() {
        let (_dir, root, pump, mut rx) = pump();
        let (live_tx, live_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = oneshot::channel();
        let backlog = vec![
            FsEvent::new(FsOp::Mkdir, root.path().join("a")),
            FsEvent::new(FsOp::Remove, root.path().join("b")),
        ];
        let task = tokio::spawn(pump.run(backlog, live_rx, done_tx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.tag, Tag::OpMkdir);
        // Nothing else may be sent until the first request is resolved.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        first.applied.unwrap().send(Ok(())).unwrap();

        let second = rx.recv().await.unwrap();
        assert_eq!(second.tag, Tag::OpRemove);
        second
            .applied
            .unwrap()
            .send(Err("gone".to_string()))
            .unwrap();

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.tag, Tag::InitFinished);
        assert!(finished.applied.is_none());
        done_rx.await.unwrap();

        drop(live_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_acknowledgement_times_out() {
        let (_dir, root, pump, mut rx) = pump();
        let (_live_tx, live_rx) = mpsc::channel(4);
        let (done_tx, _done_rx) = oneshot::channel();
        let backlog = vec![FsEvent::new(FsOp::Mkdir, root.path().join("a"))];
        let task = tokio::spawn(pump.run(backlog, live_rx, done_tx));

        let _held = rx.recv().await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::AckTimeout(_)));
    }
}
