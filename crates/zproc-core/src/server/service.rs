//! The state server: listeners, connection handling, and the state task.
//!
//! Two loopback TCP listeners are bound at start (request/reply and change
//! events). Connection handlers only decode and encode frames; every
//! operation is forwarded over an mpsc channel into a single state task,
//! which applies it against [`ServerState`]. That task is the sole mutator,
//! so every request is atomic by construction and all mutations are totally
//! ordered by revision.
//!
//! For a mutating request the state task publishes the change record to all
//! subscribers *before* the reply is sent. A subscription is established
//! inside the state task as well, so the registration revision in the
//! `Subscribed` ack is exact: every record delivered on that connection has
//! a strictly greater revision.

use crate::atomic::AtomicRegistry;
use crate::codec::{
    self, ChangeRecord, Op, Reply, ReplyBody, Request, Subscribe, Subscribed, WireError,
};
use crate::config::ServerConfig;
use crate::discovery::Endpoints;
use crate::error::{Result, ZprocError};
use crate::server::state::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Options for starting a state server.
pub struct ServerOptions {
    host: String,
    server_port: u16,
    events_port: u16,
    atomics: AtomicRegistry,
    export_env: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            server_port: 0,
            events_port: 0,
            atomics: AtomicRegistry::new(),
            export_env: false,
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host to bind both listeners on. Loopback by default.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port for the request/reply listener (0 = OS-assigned).
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    /// Port for the change-event listener (0 = OS-assigned).
    pub fn events_port(mut self, port: u16) -> Self {
        self.events_port = port;
        self
    }

    /// Atomic handler table served by this server.
    pub fn atomics(mut self, atomics: AtomicRegistry) -> Self {
        self.atomics = atomics;
        self
    }

    /// Export the bound endpoints into the process environment at start, to
    /// be inherited by spawned workers.
    pub fn export_env(mut self, export: bool) -> Self {
        self.export_env = export;
        self
    }
}

/// Handle to a running server. Dropping shuts it down.
pub struct ServerHandle {
    endpoints: Endpoints,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The addresses the server is listening on.
    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.endpoints.server_addr
    }

    pub fn events_addr(&self) -> SocketAddr {
        self.endpoints.events_addr
    }

    /// Shut down: stop accepting, close active connections, stop the state
    /// task. The state is discarded; there is no persistence.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Messages into the state task.
enum StateMsg {
    Request {
        op: Op,
        reply: oneshot::Sender<Result<ReplyBody>>,
    },
    Subscribe {
        reply: oneshot::Sender<(broadcast::Receiver<Arc<ChangeRecord>>, u64)>,
    },
}

/// The state server.
pub struct Server;

impl Server {
    /// Bind both listeners, spawn the state task and accept loops, and
    /// return a handle carrying the bound endpoints.
    pub async fn start(options: ServerOptions) -> Result<ServerHandle> {
        let reply_listener =
            TcpListener::bind((options.host.as_str(), options.server_port)).await?;
        let events_listener =
            TcpListener::bind((options.host.as_str(), options.events_port)).await?;

        let endpoints = Endpoints {
            server_addr: reply_listener.local_addr()?,
            events_addr: events_listener.local_addr()?,
        };
        if options.export_env {
            endpoints.export_env();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = mpsc::channel(ServerConfig::REQUEST_QUEUE_DEPTH);

        let state = ServerState::new(options.atomics);
        let tasks = vec![
            tokio::spawn(state_task(state, state_rx)),
            tokio::spawn(accept_loop(
                reply_listener,
                ChannelKind::Reply,
                state_tx.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(accept_loop(
                events_listener,
                ChannelKind::Events,
                state_tx,
                shutdown_rx,
            )),
        ];

        info!(
            "state server listening on {} (events on {})",
            endpoints.server_addr, endpoints.events_addr
        );

        Ok(ServerHandle {
            endpoints,
            shutdown_tx,
            tasks,
        })
    }
}

/// The single mutator. Processes one message to completion before the next;
/// publishes each committed change record before releasing the reply.
async fn state_task(mut state: ServerState, mut rx: mpsc::Receiver<StateMsg>) {
    let (events_tx, _) = broadcast::channel(ServerConfig::EVENT_CHANNEL_CAPACITY);

    while let Some(msg) = rx.recv().await {
        match msg {
            StateMsg::Request { op, reply } => {
                let (result, record) = state.apply(op);
                if let Some(record) = record {
                    debug!(revision = record.revision, "committed");
                    // Publish-before-reply: the record reaches every
                    // subscriber's queue before the caller sees its reply.
                    let _ = events_tx.send(Arc::new(record));
                }
                let _ = reply.send(result);
            }
            StateMsg::Subscribe { reply } => {
                let _ = reply.send((events_tx.subscribe(), state.revision()));
            }
        }
    }
    debug!("state task exiting");
}

#[derive(Debug, Clone, Copy)]
enum ChannelKind {
    Reply,
    Events,
}

async fn accept_loop(
    listener: TcpListener,
    kind: ChannelKind,
    state_tx: mpsc::Sender<StateMsg>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("{:?} accept loop stopping", kind);
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("{:?} connection from {}", kind, peer_addr);
                        let state_tx = state_tx.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            let result = match kind {
                                ChannelKind::Reply => {
                                    handle_reply_connection(stream, state_tx, shutdown_rx).await
                                }
                                ChannelKind::Events => {
                                    handle_events_connection(stream, state_tx, shutdown_rx).await
                                }
                            };
                            // A client fault costs only its own connection.
                            if let Err(e) = result {
                                warn!("{:?} connection {} dropped: {}", kind, peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("{:?} accept error: {}", kind, e);
                    }
                }
            }
        }
    }
}

async fn handle_reply_connection(
    mut stream: TcpStream,
    state_tx: mpsc::Sender<StateMsg>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();

    loop {
        let request: Request = tokio::select! {
            message = codec::read_message(&mut reader) => {
                match message? {
                    Some(request) => request,
                    None => return Ok(()), // clean disconnect
                }
            }
            _ = shutdown_rx.changed() => return Ok(()),
        };

        let (tx, rx) = oneshot::channel();
        state_tx
            .send(StateMsg::Request {
                op: request.op,
                reply: tx,
            })
            .await
            .map_err(|_| ZprocError::transport("state task is gone"))?;
        let result = rx
            .await
            .map_err(|_| ZprocError::transport("state task dropped the request"))?;

        let reply = match result {
            Ok(body) => Reply::success(request.id, body),
            Err(err) => Reply::failure(request.id, WireError::from_error(&err)),
        };
        codec::write_message(&mut writer, &reply).await?;
    }
}

async fn handle_events_connection(
    mut stream: TcpStream,
    state_tx: mpsc::Sender<StateMsg>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();

    let subscribe: Subscribe = match codec::read_message(&mut reader).await? {
        Some(subscribe) => subscribe,
        None => return Ok(()),
    };

    let (tx, rx) = oneshot::channel();
    state_tx
        .send(StateMsg::Subscribe { reply: tx })
        .await
        .map_err(|_| ZprocError::transport("state task is gone"))?;
    let (mut events_rx, revision) = rx
        .await
        .map_err(|_| ZprocError::transport("state task dropped the subscription"))?;

    codec::write_message(&mut writer, &Subscribed { revision }).await?;

    // Server-side key filter is an optimization only; the client re-filters.
    let filter = subscribe.keys;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(record) => {
                        if let Some(ref keys) = filter {
                            if !record.touches_any(keys) {
                                continue;
                            }
                        }
                        codec::write_message(&mut writer, record.as_ref()).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Skipping records would break the strictly
                        // increasing revision contract on this connection.
                        warn!("subscriber lagged by {} records, disconnecting", missed);
                        return Err(ZprocError::protocol(format!(
                            "subscriber lagged by {} change records",
                            missed
                        )));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn start_default() -> ServerHandle {
        Server::start(ServerOptions::new()).await.unwrap()
    }

    async fn raw_call(stream: &mut TcpStream, request: &Request) -> Reply {
        let (mut reader, mut writer) = stream.split();
        codec::write_message(&mut writer, request).await.unwrap();
        codec::read_message(&mut reader).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut handle = start_default().await;
        assert_ne!(handle.server_addr().port(), 0);
        assert_ne!(handle.events_addr().port(), 0);
        assert_ne!(handle.server_addr(), handle.events_addr());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_raw_ping_and_set_roundtrip() {
        let handle = start_default().await;
        let mut stream = TcpStream::connect(handle.server_addr()).await.unwrap();

        let reply = raw_call(&mut stream, &Request { id: 1, op: Op::Ping }).await;
        assert_eq!(reply.id, 1);
        match reply.into_result().unwrap() {
            ReplyBody::Pong { revision, .. } => assert_eq!(revision, 0),
            other => panic!("expected Pong, got {:?}", other),
        }

        let reply = raw_call(
            &mut stream,
            &Request {
                id: 2,
                op: Op::Set {
                    key: "apples".to_string(),
                    value: json!(5),
                },
            },
        )
        .await;
        assert!(matches!(
            reply.into_result().unwrap(),
            ReplyBody::Revision { revision: 1 }
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_drops_only_that_connection() {
        let handle = start_default().await;

        let mut bad = TcpStream::connect(handle.server_addr()).await.unwrap();
        codec::write_frame(&mut bad, b"not json").await.unwrap();
        // The faulty connection is dropped; either EOF or a reset is fine.
        let _ = codec::read_frame(&mut bad).await;

        // A fresh connection still works.
        let mut good = TcpStream::connect(handle.server_addr()).await.unwrap();
        let reply = raw_call(&mut good, &Request { id: 1, op: Op::Ping }).await;
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn test_subscribe_ack_carries_current_revision() {
        let handle = start_default().await;

        let mut control = TcpStream::connect(handle.server_addr()).await.unwrap();
        raw_call(
            &mut control,
            &Request {
                id: 1,
                op: Op::Set {
                    key: "a".to_string(),
                    value: json!(1),
                },
            },
        )
        .await;

        let mut events = TcpStream::connect(handle.events_addr()).await.unwrap();
        codec::write_message(&mut events, &Subscribe { keys: None })
            .await
            .unwrap();
        let ack: Subscribed = codec::read_message(&mut events).await.unwrap().unwrap();
        assert_eq!(ack.revision, 1);

        // A mutation after subscribing is delivered with revision 2.
        raw_call(
            &mut control,
            &Request {
                id: 2,
                op: Op::Set {
                    key: "b".to_string(),
                    value: json!(2),
                },
            },
        )
        .await;
        let record: ChangeRecord = codec::read_message(&mut events).await.unwrap().unwrap();
        assert_eq!(record.revision, 2);
        assert!(record.touches("b"));
    }
}
