use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::{ConnectionId, SessionError, SyncError},
    event::FsEvent,
    fsops::Root,
    protocol::Tag,
    pump::EventPump,
    session::{Request, Session, Signal},
    transport::{self, Connection},
    watcher::FileWatcher,
};

/// Drives both ends of a sync: the server accept loop and the client's
/// handshake, initial reconciliation and live watching.
pub struct SyncManager {
    config: Config,
    root: Root,
}

/// A client session past its handshake.
pub struct Client {
    events: mpsc::Sender<FsEvent>,
    initial_sync: Option<oneshot::Receiver<()>>,
    pump: JoinHandle<Result<(), SyncError>>,
    session: JoinHandle<Result<(), SessionError>>,
}

impl SyncManager {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let root = Root::open(&config.root_path)
            .with_context(|| format!("Failed to open root {}", config.root_path.display()))?;
        Ok(Self { config, root })
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    /// Accepts clients one at a time, forever.
    pub async fn serve(&self) -> Result<()> {
        let listener = transport::listen(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to listen on {}", self.config.listen_addr))?;
        info!("Serving {} on {}", self.root.path().display(), listener.local_addr()?);

        loop {
            let (stream, _) = listener.accept().await?;
            let connection = match transport::spawn(stream, self.config.queue_capacity) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Failed to set up connection: {}", e);
                    continue;
                }
            };
            info!("Accepted connection from {}", connection.peer);
            match self.serve_connection(connection).await {
                Ok(()) => info!("Client disconnected"),
                Err(e) => error!("{}", e),
            }
        }
    }

    pub async fn serve_connection(&self, connection: Connection) -> Result<(), SessionError> {
        let session = Session::server(ConnectionId::random(), self.root.clone(), connection.outbound);
        session.run(connection.inbound, None).await
    }

    /// Connects to the configured server and keeps both trees in sync until
    /// interrupted or disconnected.
    pub async fn sync(&self) -> Result<()> {
        let connection = transport::connect(&self.config.server_addr, self.config.queue_capacity)
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.server_addr))?;
        info!("Connected to {}", connection.peer);

        let mut client = self.start_client(connection).await?;
        if client.initial_sync().await.is_err() {
            client.close().await?;
            anyhow::bail!("Initial sync did not complete");
        }

        // Let our own writes from the initial sync settle before watching.
        tokio::time::sleep(self.config.settle_delay()).await;
        let mut watcher = FileWatcher::new(self.config.queue_capacity)?;
        watcher.watch(self.root.path())?;
        info!("Watching {}", self.root.path().display());

        let events = client.events();
        loop {
            tokio::select! {
                event = watcher.next_event() => match event {
                    Some(Ok(event)) => {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("{:#}", e),
                    None => break,
                },
                _ = events.closed() => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }
        drop(events);
        client.close().await
    }

    /// Runs the handshake on `connection`: parameters, then the server's file
    /// list, then starts the event pump on the reconciliation backlog.
    pub async fn start_client(&self, connection: Connection) -> Result<Client> {
        let params = self.config.params();
        let (commands, commands_rx) = mpsc::channel(1);
        let (signals_tx, mut signals) = mpsc::channel(4);
        let session = Session::client(
            ConnectionId::random(),
            self.root.clone(),
            params,
            connection.outbound,
            signals_tx,
        );
        let session = tokio::spawn(session.run(connection.inbound, Some(commands_rx)));

        let handshake = async {
            commands
                .send(Request::notify(Tag::InitSyncConfig, params.encode()?))
                .await
                .map_err(|_| SyncError::ConnectionClosed)?;
            match signals.recv().await {
                Some(Signal::ConfigAccepted) => {}
                other => return Err(unexpected(other)),
            }
            commands
                .send(Request::notify(Tag::Init, Bytes::new()))
                .await
                .map_err(|_| SyncError::ConnectionClosed)?;
            let backlog = match signals.recv().await {
                Some(Signal::FileList(backlog)) => backlog,
                other => return Err(unexpected(other)),
            };
            Ok::<_, SyncError>(backlog)
        };
        let backlog = match handshake.await {
            Ok(backlog) => backlog,
            Err(e) => {
                drop(commands);
                return match session.await? {
                    Err(session_error) => Err(session_error.into()),
                    Ok(()) => Err(e.into()),
                };
            }
        };
        info!("Handshake complete, {} events to reconcile", backlog.len());

        let (events, live) = mpsc::channel(self.config.queue_capacity);
        let (initial_tx, initial_rx) = oneshot::channel();
        let pump = EventPump::new(commands, self.root.clone(), self.config.ack_timeout());
        let pump = tokio::spawn(pump.run(backlog, live, initial_tx));

        Ok(Client {
            events,
            initial_sync: Some(initial_rx),
            pump,
            session,
        })
    }
}

fn unexpected(signal: Option<Signal>) -> SyncError {
    match signal {
        None => SyncError::Handshake("session ended during handshake".to_string()),
        Some(signal) => SyncError::Handshake(format!("unexpected {signal:?}")),
    }
}

impl Client {
    /// Queue for live events.
    pub fn events(&self) -> mpsc::Sender<FsEvent> {
        self.events.clone()
    }

    /// Resolves once the reconciliation backlog has been applied and the
    /// peer has been sent `InitFinished`. Later calls return immediately.
    pub async fn initial_sync(&mut self) -> Result<(), SyncError> {
        match self.initial_sync.take() {
            Some(done) => done.await.map_err(|_| SyncError::ConnectionClosed),
            None => Ok(()),
        }
    }

    /// Stops accepting events, waits for the pump to drain and then for the
    /// session to end.
    pub async fn close(self) -> Result<()> {
        drop(self.events);
        let pumped = self.pump.await?;
        let session = self.session.await?;
        session?;
        pumped?;
        Ok(())
    }
}
