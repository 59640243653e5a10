//! Per-connection sync state machine.
//!
//! A [`Session`] owns the receive buffer and the transfer context of one side
//! of a connection. Inbound chunks are framed and dispatched by tag; outbound
//! requests from the event pump are sent one at a time and resolved when the
//! peer acknowledges them.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncParams;
use crate::error::{ConnectionId, DeltaError, SessionError, SyncError};
use crate::event::{FsEvent, FsOp};
use crate::fsops::{self, Root};
use crate::protocol::{self, FrameBuffer, Message, PayloadAssembler, Tag};
use crate::rsync::DeltaEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Outcome of one acknowledged operation: `Err` carries the peer's (or our
/// own) failure reason.
pub type Applied = Result<(), String>;

/// Something the local side wants to send.
#[derive(Debug)]
pub struct Request {
    pub tag: Tag,
    pub payload: Bytes,
    /// Local file the peer's reply will write into or diff against.
    pub transfer: Option<PathBuf>,
    /// Resolved on `SyncFinished` / `SyncFailed`. `None` for notifications.
    pub applied: Option<oneshot::Sender<Applied>>,
}

impl Request {
    pub fn notify(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
            transfer: None,
            applied: None,
        }
    }
}

/// Handshake progress reported to the client driver.
#[derive(Debug)]
pub enum Signal {
    ConfigAccepted,
    /// The server's listing is complete; these events reconcile the trees.
    FileList(Vec<FsEvent>),
}

/// The file under active transfer. Created when a transfer starts and
/// consumed when it completes.
struct Transfer {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    failure: Option<String>,
}

impl Transfer {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            failure: None,
        }
    }

    async fn append(&mut self, chunk: &[u8]) {
        if self.failure.is_some() {
            return;
        }
        let mut file = match self.file.take() {
            Some(file) => file,
            None => match fsops::open_for_write(&self.path).await {
                Ok(file) => file,
                Err(e) => {
                    self.failure = Some(format!("{}: {e}", self.path.display()));
                    return;
                }
            },
        };
        match file.write_all(chunk).await {
            Ok(()) => self.file = Some(file),
            Err(e) => self.failure = Some(format!("{}: {e}", self.path.display())),
        }
    }

    async fn finish(self) -> Result<PathBuf, String> {
        if let Some(reason) = self.failure {
            return Err(reason);
        }
        if let Some(mut file) = self.file {
            file.flush()
                .await
                .map_err(|e| format!("{}: {e}", self.path.display()))?;
        }
        Ok(self.path)
    }
}

pub struct Session {
    id: ConnectionId,
    role: Role,
    root: Root,
    params: SyncParams,
    negotiated: bool,
    outbound: mpsc::Sender<Bytes>,
    signals: Option<mpsc::Sender<Signal>>,
    transfer: Option<Transfer>,
    pending: Option<oneshot::Sender<Applied>>,
    assembler: PayloadAssembler,
    backlog: Vec<FsEvent>,
    listed: HashSet<PathBuf>,
    last_tag: Option<u16>,
}

impl Session {
    pub fn client(
        id: ConnectionId,
        root: Root,
        params: SyncParams,
        outbound: mpsc::Sender<Bytes>,
        signals: mpsc::Sender<Signal>,
    ) -> Self {
        let mut session = Self::new(id, Role::Client, root, outbound);
        session.params = params;
        session.signals = Some(signals);
        session
    }

    /// The server learns its parameters from `InitSyncConfig`.
    pub fn server(id: ConnectionId, root: Root, outbound: mpsc::Sender<Bytes>) -> Self {
        Self::new(id, Role::Server, root, outbound)
    }

    fn new(id: ConnectionId, role: Role, root: Root, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            role,
            root,
            params: SyncParams::default(),
            negotiated: false,
            outbound,
            signals: None,
            transfer: None,
            pending: None,
            assembler: PayloadAssembler::default(),
            backlog: Vec::new(),
            listed: HashSet::new(),
            last_tag: None,
        }
    }

    /// Runs until the peer disconnects, the local side stops sending
    /// requests (client), or a fatal error occurs.
    pub async fn run(
        self,
        inbound: mpsc::Receiver<Bytes>,
        commands: Option<mpsc::Receiver<Request>>,
    ) -> Result<(), SessionError> {
        let span = info_span!("session", conn = %self.id, role = %self.role);
        self.run_inner(inbound, commands).instrument(span).await
    }

    async fn run_inner(
        mut self,
        mut inbound: mpsc::Receiver<Bytes>,
        mut commands: Option<mpsc::Receiver<Request>>,
    ) -> Result<(), SessionError> {
        let mut frames = FrameBuffer::new();
        loop {
            tokio::select! {
                chunk = inbound.recv() => {
                    let Some(chunk) = chunk else {
                        info!("peer closed the connection");
                        break;
                    };
                    frames.extend(&chunk);
                    loop {
                        let msg = match frames.next_message() {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => return Err(self.abort(e.into())),
                        };
                        if let Err(e) = self.receive(msg).await {
                            return Err(self.abort(e));
                        }
                    }
                }
                request = recv_request(&mut commands), if commands.is_some() => {
                    let Some(request) = request else {
                        debug!("no more local requests");
                        break;
                    };
                    if let Err(e) = self.submit(request).await {
                        return Err(self.abort(e));
                    }
                }
            }
        }
        Ok(())
    }

    fn abort(&mut self, source: SyncError) -> SessionError {
        self.pending = None;
        self.transfer = None;
        SessionError {
            connection: self.id,
            role: self.role,
            last_tag: self.last_tag,
            source,
        }
    }

    async fn submit(&mut self, request: Request) -> Result<(), SyncError> {
        if let Some(applied) = request.applied {
            if self.pending.is_some() {
                return Err(SyncError::OperationInFlight);
            }
            self.pending = Some(applied);
            self.transfer = request.transfer.map(Transfer::new);
        }
        debug!(tag = ?request.tag, "sending request");
        self.send(request.tag, request.payload).await
    }

    async fn receive(&mut self, msg: Message) -> Result<(), SyncError> {
        self.last_tag = Some(msg.tag);
        let tag = Tag::try_from(msg.tag).map_err(SyncError::UnknownOperation)?;

        // File bodies are written as they arrive instead of being joined.
        if tag == Tag::SyncFileDirect && self.assembler.is_idle() {
            return self.on_file_chunk(msg.payload, msg.is_final).await;
        }
        let Some(msg) = self.assembler.push(msg)? else {
            return Ok(());
        };

        match self.dispatch(tag, msg.payload).await {
            Err(e) if !e.is_fatal() => self.report_failure(tag, e.to_string()).await,
            other => other,
        }
    }

    async fn dispatch(&mut self, tag: Tag, payload: Bytes) -> Result<(), SyncError> {
        debug!(?tag, len = payload.len(), "received");
        match tag {
            Tag::Init => {
                self.expect_role(tag, Role::Server)?;
                self.send_listing().await
            }
            Tag::InitSyncConfig => {
                self.expect_role(tag, Role::Server)?;
                let params = SyncParams::decode(&payload)?;
                params.validate().map_err(SyncError::InvalidParams)?;
                info!(
                    truncate_block_size = params.truncate_block_size,
                    transfer_block_size = params.transfer_block_size,
                    "adopted peer parameters"
                );
                self.params = params;
                self.negotiated = true;
                self.send(Tag::Done, Bytes::new()).await
            }
            Tag::Done => {
                self.expect_role(tag, Role::Client)?;
                self.negotiated = true;
                self.signal(Signal::ConfigAccepted).await
            }
            Tag::InitSyncFolder => {
                let path = self.local_path(tag, &payload)?;
                self.listed.insert(path.clone());
                if !fsops::is_directory(&path).await {
                    fsops::mkdir(&path).await?;
                }
                Ok(())
            }
            Tag::InitSyncFile => {
                let path = self.local_path(tag, &payload)?;
                self.listed.insert(path.clone());
                self.backlog.push(FsEvent::new(FsOp::Fetch, path));
                Ok(())
            }
            Tag::InitUploadList => {
                self.expect_role(tag, Role::Client)?;
                self.collect_uploads().await?;
                let backlog = std::mem::take(&mut self.backlog);
                info!(events = backlog.len(), "file list received");
                self.signal(Signal::FileList(backlog)).await
            }
            Tag::InitFinished => {
                self.expect_role(tag, Role::Server)?;
                info!("peer finished its initial sync");
                Ok(())
            }
            Tag::SyncFileEmpty => {
                let path = self.local_path(tag, &payload)?;
                self.stream_file(path).await
            }
            Tag::SyncFileNotEmpty => {
                let (digest, relative) =
                    protocol::decode_probe(&payload).map_err(|e| SyncError::malformed(tag, e))?;
                let path = self.root.local(&relative).map_err(|e| SyncError::malformed(tag, e))?;
                if fsops::content_hash(&path).await? == digest {
                    debug!(path = %relative, "already identical");
                    return self.send(Tag::SyncFinished, Bytes::new()).await;
                }
                self.transfer = Some(Transfer::new(path));
                self.send(Tag::OpModify, Bytes::from(relative)).await
            }
            Tag::SyncFileDirect => self.on_file_chunk(payload, true).await,
            Tag::SyncFinished => {
                self.transfer = None;
                self.release(Ok(()));
                Ok(())
            }
            Tag::SyncFailed => {
                let reason = String::from_utf8_lossy(&payload).into_owned();
                warn!(%reason, "peer failed to apply operation");
                self.transfer = None;
                self.release(Err(reason));
                Ok(())
            }
            Tag::OpCreate => {
                let path = self.local_path(tag, &payload)?;
                fsops::create(&path).await?;
                self.transfer = Some(Transfer::new(path));
                self.send(Tag::SyncFileEmpty, payload).await
            }
            Tag::OpRemove => {
                let path = self.local_path(tag, &payload)?;
                fsops::delete_recursive(&path).await?;
                self.send(Tag::SyncFinished, Bytes::new()).await
            }
            Tag::OpMkdir => {
                let path = self.local_path(tag, &payload)?;
                fsops::mkdir(&path).await?;
                self.send(Tag::SyncFinished, Bytes::new()).await
            }
            Tag::OpRename => {
                let (new, old) =
                    protocol::decode_rename(&payload).map_err(|e| SyncError::malformed(tag, e))?;
                let new = self.root.local(&new).map_err(|e| SyncError::malformed(tag, e))?;
                let old = self.root.local(&old).map_err(|e| SyncError::malformed(tag, e))?;
                fsops::rename(&old, &new).await?;
                self.send(Tag::SyncFinished, Bytes::new()).await
            }
            Tag::OpModify => {
                self.expect_negotiated(tag)?;
                let path = self.local_path(tag, &payload)?;
                fsops::create_if_absent(&path).await?;
                self.transfer = Some(Transfer::new(path.clone()));
                let engine = self.engine();
                let table = blocking(move || engine.checksum_table(&path)).await?;
                self.send(Tag::SyncGenerateDiff, table).await
            }
            Tag::SyncGenerateDiff => {
                self.expect_negotiated(tag)?;
                let transfer = self.take_transfer(tag)?;
                let engine = self.engine();
                let script = blocking(move || engine.diff(&payload, &transfer.path)).await?;
                self.send(Tag::SyncReformFile, script).await
            }
            Tag::SyncReformFile => {
                self.expect_negotiated(tag)?;
                let transfer = self.take_transfer(tag)?;
                let engine = self.engine();
                let path = transfer.path.clone();
                blocking(move || engine.apply(&payload, &path)).await?;
                debug!(path = %transfer.path.display(), "reconstructed");
                self.release(Ok(()));
                self.send(Tag::SyncFinished, Bytes::new()).await
            }
        }
    }

    /// `SyncFileDirect`: append to the active transfer; on the final chunk the
    /// client releases its waiting event and the server acknowledges.
    async fn on_file_chunk(&mut self, chunk: Bytes, is_final: bool) -> Result<(), SyncError> {
        let transfer = self
            .transfer
            .as_mut()
            .ok_or(SyncError::NoActiveTransfer(Tag::SyncFileDirect))?;
        transfer.append(&chunk).await;
        if !is_final {
            return Ok(());
        }
        let transfer = self
            .take_transfer(Tag::SyncFileDirect)?
            .finish()
            .await;
        match transfer {
            Ok(path) => {
                debug!(path = %path.display(), "file received");
                match self.role {
                    Role::Client => {
                        self.release(Ok(()));
                        Ok(())
                    }
                    Role::Server => self.send(Tag::SyncFinished, Bytes::new()).await,
                }
            }
            Err(reason) => self.report_failure(Tag::SyncFileDirect, reason).await,
        }
    }

    /// Sends the local tree to the client, folders and files, then marks the
    /// end of the listing.
    async fn send_listing(&mut self) -> Result<(), SyncError> {
        let entries = fsops::list_tree(self.root.path()).await?;
        for entry in &entries {
            let Some(relative) = self.root.relative(&entry.path) else {
                continue;
            };
            let tag = if entry.is_dir {
                Tag::InitSyncFolder
            } else {
                Tag::InitSyncFile
            };
            self.send(tag, Bytes::from(relative)).await?;
        }
        info!(entries = entries.len(), "sent file list");
        self.send(Tag::InitUploadList, Bytes::new()).await
    }

    /// Queues local entries the server did not list.
    async fn collect_uploads(&mut self) -> Result<(), SyncError> {
        for entry in fsops::list_tree(self.root.path()).await? {
            if self.listed.contains(&entry.path) {
                continue;
            }
            let op = if entry.is_dir { FsOp::Mkdir } else { FsOp::Create };
            self.backlog.push(FsEvent::new(op, entry.path));
        }
        Ok(())
    }

    async fn stream_file(&mut self, path: PathBuf) -> Result<(), SyncError> {
        let chunk_size = self.params.transfer_block_size as usize;
        let mut file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        let mut remaining = size;
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = remaining.min(chunk_size as u64) as usize;
            file.read_exact(&mut buf[..n]).await?;
            remaining -= n as u64;
            let is_final = remaining == 0;
            self.send_frame(Tag::SyncFileDirect, &buf[..n], is_final).await?;
            if is_final {
                break;
            }
        }
        debug!(path = %path.display(), size, "file sent");
        Ok(())
    }

    async fn report_failure(&mut self, tag: Tag, reason: String) -> Result<(), SyncError> {
        warn!(?tag, %reason, "operation failed");
        self.transfer = None;
        self.release(Err(reason.clone()));
        self.send(Tag::SyncFailed, Bytes::from(reason)).await
    }

    fn release(&mut self, outcome: Applied) {
        if let Some(applied) = self.pending.take() {
            let _ = applied.send(outcome);
        }
    }

    async fn signal(&self, signal: Signal) -> Result<(), SyncError> {
        match &self.signals {
            Some(signals) => signals
                .send(signal)
                .await
                .map_err(|_| SyncError::Handshake("driver is gone".to_string())),
            None => Ok(()),
        }
    }

    fn local_path(&self, tag: Tag, payload: &[u8]) -> Result<PathBuf, SyncError> {
        let relative = std::str::from_utf8(payload)
            .map_err(|e| SyncError::malformed(tag, format!("path is not UTF-8: {e}")))?;
        self.root
            .local(relative)
            .map_err(|e| SyncError::malformed(tag, e))
    }

    fn take_transfer(&mut self, tag: Tag) -> Result<Transfer, SyncError> {
        self.transfer.take().ok_or(SyncError::NoActiveTransfer(tag))
    }

    fn expect_role(&self, tag: Tag, role: Role) -> Result<(), SyncError> {
        if self.role == role {
            Ok(())
        } else {
            Err(SyncError::UnexpectedForRole {
                tag,
                role: self.role,
            })
        }
    }

    fn expect_negotiated(&self, tag: Tag) -> Result<(), SyncError> {
        if self.negotiated {
            Ok(())
        } else {
            Err(SyncError::NotNegotiated(tag))
        }
    }

    fn engine(&self) -> DeltaEngine {
        DeltaEngine::new(self.params.truncate_block_size as usize)
    }

    /// Sends a logical payload, split into frames of at most the transfer
    /// block size.
    async fn send(&self, tag: Tag, payload: Bytes) -> Result<(), SyncError> {
        let chunk_size = self.params.transfer_block_size as usize;
        if payload.len() <= chunk_size {
            return self.send_frame(tag, &payload, true).await;
        }
        let mut chunks = payload.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            self.send_frame(tag, chunk, chunks.peek().is_none()).await?;
        }
        Ok(())
    }

    async fn send_frame(&self, tag: Tag, payload: &[u8], is_final: bool) -> Result<(), SyncError> {
        self.outbound
            .send(protocol::encode(tag as u16, payload, is_final))
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }
}

async fn recv_request(commands: &mut Option<mpsc::Receiver<Request>>) -> Option<Request> {
    match commands {
        Some(commands) => commands.recv().await,
        None => None,
    }
}

async fn blocking<T, F>(work: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, DeltaError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SyncError::Io(io::Error::other(e)))?
        .map_err(SyncError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        root: tempfile::TempDir,
        to_session: mpsc::Sender<Bytes>,
        from_session: mpsc::Receiver<Bytes>,
        commands: Option<mpsc::Sender<Request>>,
        _signals: Option<mpsc::Receiver<Signal>>,
        frames: FrameBuffer,
        task: tokio::task::JoinHandle<Result<(), SessionError>>,
    }

    impl Harness {
        fn server() -> Self {
            let root = tempfile::tempdir().unwrap();
            let (to_session, inbound) = mpsc::channel(64);
            let (outbound, from_session) = mpsc::channel(64);
            let session = Session::server(
                ConnectionId(1),
                Root::open(root.path()).unwrap(),
                outbound,
            );
            let task = tokio::spawn(session.run(inbound, None));
            Self {
                root,
                to_session,
                from_session,
                commands: None,
                _signals: None,
                frames: FrameBuffer::new(),
                task,
            }
        }

        /// A client session past negotiation, fed requests directly.
        fn client(params: SyncParams) -> Self {
            let root = tempfile::tempdir().unwrap();
            let (to_session, inbound) = mpsc::channel(64);
            let (outbound, from_session) = mpsc::channel(64);
            let (commands, commands_rx) = mpsc::channel(1);
            let (signals_tx, signals) = mpsc::channel(4);
            let mut session = Session::client(
                ConnectionId(2),
                Root::open(root.path()).unwrap(),
                params,
                outbound,
                signals_tx,
            );
            session.negotiated = true;
            let task = tokio::spawn(session.run(inbound, Some(commands_rx)));
            Self {
                root,
                to_session,
                from_session,
                commands: Some(commands),
                _signals: Some(signals),
                frames: FrameBuffer::new(),
                task,
            }
        }

        async fn request(
            &self,
            tag: Tag,
            payload: &'static str,
            transfer: Option<PathBuf>,
        ) -> oneshot::Receiver<Applied> {
            let (applied, outcome) = oneshot::channel();
            let request = Request {
                tag,
                payload: Bytes::from_static(payload.as_bytes()),
                transfer,
                applied: Some(applied),
            };
            self.commands.as_ref().unwrap().send(request).await.unwrap();
            outcome
        }

        async fn send(&self, tag: Tag, payload: impl Into<Bytes>) {
            let payload = payload.into();
            self.to_session
                .send(protocol::encode(tag as u16, &payload, true))
                .await
                .unwrap();
        }

        async fn negotiate(&mut self) {
            let params = SyncParams::default().encode().unwrap();
            self.send(Tag::InitSyncConfig, params).await;
            assert_eq!(self.next().await.tag, Tag::Done as u16);
        }

        async fn next(&mut self) -> Message {
            loop {
                if let Some(msg) = self.frames.next_message().unwrap() {
                    return msg;
                }
                let chunk = self.from_session.recv().await.expect("session closed");
                self.frames.extend(&chunk);
            }
        }

        fn path(&self, relative: &str) -> PathBuf {
            std::fs::canonicalize(self.root.path()).unwrap().join(relative)
        }
    }

    #[tokio::test]
    async fn unknown_tag_ends_the_session() {
        let h = Harness::server();
        h.to_session
            .send(protocol::encode(7, b"", true))
            .await
            .unwrap();
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err.source, SyncError::UnknownOperation(7)));
        assert_eq!(err.last_tag, Some(7));
        assert_eq!(err.role, Role::Server);
    }

    #[tokio::test]
    async fn bad_signature_ends_the_session() {
        let h = Harness::server();
        h.to_session
            .send(Bytes::from_static(&[0u8; 32]))
            .await
            .unwrap();
        let err = h.task.await.unwrap().unwrap_err();
        assert!(err.source.is_fatal());
        assert!(matches!(err.source, SyncError::Frame(_)));
    }

    #[tokio::test]
    async fn client_only_tags_are_rejected_by_the_server() {
        let h = Harness::server();
        h.send(Tag::InitUploadList, Bytes::new()).await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.source,
            SyncError::UnexpectedForRole {
                tag: Tag::InitUploadList,
                role: Role::Server
            }
        ));
    }

    #[tokio::test]
    async fn delta_before_negotiation_is_fatal() {
        let h = Harness::server();
        h.send(Tag::OpModify, "a.txt").await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err.source, SyncError::NotNegotiated(Tag::OpModify)));
    }

    #[tokio::test]
    async fn escaping_path_is_fatal() {
        let h = Harness::server();
        h.send(Tag::OpRemove, "../outside").await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.source,
            SyncError::MalformedPayload {
                tag: Tag::OpRemove,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn filesystem_operations_are_acknowledged() {
        let mut h = Harness::server();
        h.send(Tag::OpMkdir, "sub/inner").await;
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);
        assert!(h.path("sub/inner").is_dir());

        std::fs::write(h.path("sub/inner/f.txt"), b"x").unwrap();
        h.send(Tag::OpRename, protocol::encode_rename("g.txt", "sub/inner/f.txt"))
            .await;
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);
        assert_eq!(std::fs::read(h.path("g.txt")).unwrap(), b"x");

        h.send(Tag::OpRemove, "sub").await;
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);
        assert!(!h.path("sub").exists());
    }

    #[tokio::test]
    async fn failed_operation_is_reported_not_fatal() {
        let mut h = Harness::server();
        h.send(Tag::OpRename, protocol::encode_rename("b", "missing"))
            .await;
        let reply = h.next().await;
        assert_eq!(reply.tag, Tag::SyncFailed as u16);
        assert!(!reply.payload.is_empty());

        h.send(Tag::OpMkdir, "still-alive").await;
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);
    }

    #[tokio::test]
    async fn local_write_failure_releases_own_event_and_reports_once() {
        let mut h = Harness::client(SyncParams {
            transfer_block_size: 64,
            ..SyncParams::default()
        });
        std::fs::write(h.path("blocker"), b"a file where a folder should be").unwrap();

        let outcome = h
            .request(Tag::SyncFileEmpty, "blocker/a.txt", Some(h.path("blocker/a.txt")))
            .await;
        let ask = h.next().await;
        assert_eq!(ask.tag, Tag::SyncFileEmpty as u16);
        assert_eq!(&ask.payload[..], b"blocker/a.txt");

        let body = vec![b'x'; 150];
        let chunks: Vec<&[u8]> = body.chunks(64).collect();
        let (last, rest) = chunks.split_last().unwrap();
        for chunk in rest {
            h.to_session
                .send(protocol::encode(Tag::SyncFileDirect as u16, chunk, false))
                .await
                .unwrap();
        }
        // Nothing is reported until the final chunk.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), h.from_session.recv())
                .await
                .is_err()
        );
        h.to_session
            .send(protocol::encode(Tag::SyncFileDirect as u16, last, true))
            .await
            .unwrap();

        let reason = outcome.await.unwrap().unwrap_err();
        assert!(reason.contains("blocker"));
        let report = h.next().await;
        assert_eq!(report.tag, Tag::SyncFailed as u16);
        assert_eq!(&report.payload[..], reason.as_bytes());

        // The next request goes out and completes; no second report precedes it.
        let outcome = h.request(Tag::OpMkdir, "after", None).await;
        let next = h.next().await;
        assert_eq!(next.tag, Tag::OpMkdir as u16);
        h.send(Tag::SyncFinished, Bytes::new()).await;
        assert_eq!(outcome.await.unwrap(), Ok(()));
        assert!(!h.path("blocker/a.txt").exists());
    }

    #[tokio::test]
    async fn create_requests_the_body_and_acknowledges_it() {
        let mut h = Harness::server();
        h.send(Tag::OpCreate, "new.txt").await;
        let reply = h.next().await;
        assert_eq!(reply.tag, Tag::SyncFileEmpty as u16);
        assert_eq!(&reply.payload[..], b"new.txt");

        for (chunk, last) in [(&b"hel"[..], false), (&b"lo"[..], true)] {
            h.to_session
                .send(protocol::encode(Tag::SyncFileDirect as u16, chunk, last))
                .await
                .unwrap();
        }
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);
        assert_eq!(std::fs::read(h.path("new.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn file_chunk_without_transfer_is_fatal() {
        let h = Harness::server();
        h.send(Tag::SyncFileDirect, "stray").await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(
            err.source,
            SyncError::NoActiveTransfer(Tag::SyncFileDirect)
        ));
    }

    #[tokio::test]
    async fn init_lists_folders_then_upload_marker() {
        let mut h = Harness::server();
        std::fs::create_dir(h.path("sub")).unwrap();
        std::fs::write(h.path("sub/a.txt"), b"a").unwrap();
        h.send(Tag::Init, Bytes::new()).await;

        let first = h.next().await;
        assert_eq!(first.tag, Tag::InitSyncFolder as u16);
        assert_eq!(&first.payload[..], b"sub");
        let second = h.next().await;
        assert_eq!(second.tag, Tag::InitSyncFile as u16);
        assert_eq!(&second.payload[..], b"sub/a.txt");
        assert_eq!(h.next().await.tag, Tag::InitUploadList as u16);
    }

    #[tokio::test]
    async fn identical_probe_is_finished_immediately() {
        let mut h = Harness::server();
        std::fs::write(h.path("same.txt"), b"same").unwrap();
        let digest = crate::rsync::strong_hash(b"same");
        h.send(Tag::SyncFileNotEmpty, protocol::encode_probe(&digest, "same.txt"))
            .await;
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);

        let stale = crate::rsync::strong_hash(b"other");
        h.send(Tag::SyncFileNotEmpty, protocol::encode_probe(&stale, "same.txt"))
            .await;
        let reply = h.next().await;
        assert_eq!(reply.tag, Tag::OpModify as u16);
        assert_eq!(&reply.payload[..], b"same.txt");
    }

    #[tokio::test]
    async fn rejects_invalid_parameters() {
        let h = Harness::server();
        let params = SyncParams {
            truncate_block_size: 0,
            transfer_block_size: 4096,
        };
        h.send(Tag::InitSyncConfig, params.encode().unwrap()).await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err.source, SyncError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn oversized_parameters_end_the_session() {
        let h = Harness::server();
        let params = SyncParams {
            truncate_block_size: u32::MAX,
            transfer_block_size: u32::MAX,
        };
        h.send(Tag::InitSyncConfig, params.encode().unwrap()).await;
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err.source, SyncError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn modify_sends_checksum_table_after_negotiation() {
        let mut h = Harness::server();
        h.negotiate().await;
        std::fs::write(h.path("big.bin"), vec![9u8; 3000]).unwrap();
        h.send(Tag::OpModify, "big.bin").await;
        let reply = h.next().await;
        assert_eq!(reply.tag, Tag::SyncGenerateDiff as u16);
        assert_eq!(reply.payload.len(), 3 * crate::rsync::checksum::RECORD_LEN);

        let script = crate::rsync::DiffScript {
            records: vec![crate::rsync::DiffRecord::Literal {
                start: 0,
                end: 3,
                data: Bytes::from_static(b"new"),
            }],
        };
        h.send(Tag::SyncReformFile, script.encode()).await;
        assert_eq!(h.next().await.tag, Tag::SyncFinished as u16);
        assert_eq!(std::fs::read(h.path("big.bin")).unwrap(), b"new");
    }
}
