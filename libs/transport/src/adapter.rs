//! # Transport Adapter - Blocking Facade
//!
//! ## Purpose
//! Owns one pub/sub connection and presents it to the worker threads as a
//! blocking API: `subscribe`, `receive`, `publish`, `stop`. Internally an
//! async wire client runs on a dedicated tokio runtime; its reader task feeds
//! an unbounded channel that `receive()` pops from.
//!
//! ## Reconnection
//! Initial connection and every reconnect walk the configured endpoint list
//! with capped linear backoff and never give up until `stop()`. After a
//! reconnect the full subscription table is replayed before any message is
//! read, so subscribers never need to resubscribe.

use crate::wire::{self, ClientFrame, ServerFrame};
use crate::{
    BackoffPolicy, Connection, Connector, TransportError, TransportResult, WireMessage,
    DISCONNECTED,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Options for one adapter: the endpoint list for its side of the bridge,
/// the pre-built TLS context (passed through unmodified), and backoff.
#[derive(Clone)]
pub struct TransportOptions {
    /// Name used in logs and the wire-level Connect frame
    pub name: String,
    /// Endpoints tried in order on every (re)connect
    pub servers: Vec<String>,
    /// TLS context from the credentials provider, if the bus requires TLS
    pub tls: Option<native_tls::TlsConnector>,
    pub backoff: BackoffPolicy,
}

impl TransportOptions {
    pub fn new(name: impl Into<String>, servers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            servers,
            tls: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A plain or TLS-wrapped stream to the bus
enum WireStream {
    Plain(TcpStream),
    Tls(tokio_native_tls::TlsStream<TcpStream>),
}

impl AsyncRead for WireStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WireStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            WireStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WireStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            WireStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            WireStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WireStream::Plain(s) => Pin::new(s).poll_flush(cx),
            WireStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WireStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            WireStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[derive(Clone)]
struct SubEntry {
    queue_group: Option<String>,
    sid: u64,
}

/// State shared between the blocking API and the reader task
struct Shared {
    options: TransportOptions,
    writer: tokio::sync::Mutex<Option<WriteHalf<WireStream>>>,
    subscriptions: Mutex<HashMap<String, SubEntry>>,
    connected: Mutex<Option<String>>,
    stopped: AtomicBool,
    next_sid: AtomicU64,
    /// Bumped to tell the reader to drop the live connection
    reset: watch::Sender<u64>,
}

/// Blocking pub/sub connection over the async wire client
pub struct TransportAdapter {
    runtime: tokio::runtime::Runtime,
    shared: Arc<Shared>,
    inbox: Receiver<WireMessage>,
}

impl TransportAdapter {
    /// Establish the connection, blocking until one endpoint accepts.
    /// Retries indefinitely with capped backoff; only fails once stopped.
    pub fn start(options: TransportOptions) -> TransportResult<Self> {
        if options.servers.is_empty() {
            return Err(TransportError::Config(format!(
                "no servers configured for transport {}",
                options.name
            )));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("{}-transport", options.name))
            .enable_all()
            .build()?;

        let (reset, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            options,
            writer: tokio::sync::Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            connected: Mutex::new(None),
            stopped: AtomicBool::new(false),
            next_sid: AtomicU64::new(0),
            reset,
        });

        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        // subscribe before connecting so a stop() racing with startup is
        // never missed by the reader
        let reset_rx = shared.reset.subscribe();
        let read = runtime.block_on(establish(&shared))?;
        runtime.spawn(run_reader(shared.clone(), read, inbox_tx, reset_rx));

        Ok(Self {
            runtime,
            shared,
            inbox: inbox_rx,
        })
    }

    fn send_frame(&self, frame: &ClientFrame) -> TransportResult<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }

        let shared = &self.shared;
        self.runtime.block_on(async {
            let mut guard = shared.writer.lock().await;
            let writer = guard.as_mut().ok_or(TransportError::Disconnected)?;
            match wire::write_frame(writer, frame).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // a failed write leaves the stream in an unknown state
                    guard.take();
                    *shared.connected.lock() = None;
                    shared.reset.send_modify(|v| *v += 1);
                    Err(e)
                }
            }
        })
    }
}

impl Connection for TransportAdapter {
    fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> TransportResult<()> {
        if self.shared.subscriptions.lock().contains_key(subject) {
            return Ok(());
        }

        let sid = self.shared.next_sid.fetch_add(1, Ordering::SeqCst) + 1;
        self.send_frame(&ClientFrame::Sub {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            sid,
        })?;

        self.shared.subscriptions.lock().insert(
            subject.to_string(),
            SubEntry {
                queue_group: queue_group.map(str::to_string),
                sid,
            },
        );

        debug!(
            transport = %self.shared.options.name,
            subject,
            queue_group = queue_group.unwrap_or("none"),
            "subscribed"
        );

        Ok(())
    }

    fn receive(&self) -> TransportResult<WireMessage> {
        self.inbox.recv().map_err(|_| TransportError::Stopped)
    }

    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        reply_to: Option<&str>,
    ) -> TransportResult<()> {
        self.send_frame(&ClientFrame::Pub {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload: payload.to_vec(),
        })
    }

    fn connected_server(&self) -> String {
        self.shared
            .connected
            .lock()
            .clone()
            .unwrap_or_else(|| DISCONNECTED.to_string())
    }

    fn force_reconnect(&self) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            transport = %self.shared.options.name,
            "dropping connection for forced reconnect"
        );
        self.shared.reset.send_modify(|v| *v += 1);
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.reset.send_modify(|v| *v += 1);

        let shared = self.shared.clone();
        self.runtime.block_on(async move {
            if let Some(mut writer) = shared.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        });

        *self.shared.connected.lock() = None;
        info!(transport = %self.shared.options.name, "transport stopped");
    }
}

/// Dial one endpoint, wrapping in TLS when a context was provided
async fn dial(server: &str, tls: Option<&native_tls::TlsConnector>) -> TransportResult<WireStream> {
    let tcp = TcpStream::connect(server).await?;
    let _ = tcp.set_nodelay(true);

    match tls {
        None => Ok(WireStream::Plain(tcp)),
        Some(connector) => {
            let host = server.rsplit_once(':').map(|(h, _)| h).unwrap_or(server);
            let connector = tokio_native_tls::TlsConnector::from(connector.clone());
            Ok(WireStream::Tls(connector.connect(host, tcp).await?))
        }
    }
}

/// Connect to the first endpoint that accepts, send the Connect frame and
/// replay the subscription table. Loops with capped backoff until stopped.
async fn establish(shared: &Shared) -> TransportResult<ReadHalf<WireStream>> {
    let mut attempt: u32 = 0;

    loop {
        for server in &shared.options.servers {
            if shared.stopped.load(Ordering::SeqCst) {
                return Err(TransportError::Stopped);
            }

            match try_connect(shared, server).await {
                Ok(read) => {
                    info!(
                        transport = %shared.options.name,
                        server = %server,
                        "connected"
                    );
                    return Ok(read);
                }
                Err(e) => {
                    warn!(
                        transport = %shared.options.name,
                        server = %server,
                        error = %e,
                        "connection attempt failed"
                    );
                }
            }
        }

        if shared.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }

        attempt += 1;
        tokio::time::sleep(shared.options.backoff.delay(attempt)).await;
    }
}

async fn try_connect(shared: &Shared, server: &str) -> TransportResult<ReadHalf<WireStream>> {
    let stream = dial(server, shared.options.tls.as_ref()).await?;
    let (read, mut write) = tokio::io::split(stream);

    wire::write_frame(
        &mut write,
        &ClientFrame::Connect {
            name: shared.options.name.clone(),
        },
    )
    .await?;

    let subscriptions: Vec<(String, SubEntry)> = shared
        .subscriptions
        .lock()
        .iter()
        .map(|(subject, entry)| (subject.clone(), entry.clone()))
        .collect();

    for (subject, entry) in subscriptions {
        wire::write_frame(
            &mut write,
            &ClientFrame::Sub {
                subject,
                queue_group: entry.queue_group,
                sid: entry.sid,
            },
        )
        .await?;
    }

    *shared.writer.lock().await = Some(write);
    *shared.connected.lock() = Some(server.to_string());

    Ok(read)
}

/// Long-lived reader: pushes inbound messages onto the adapter inbox and
/// heals the connection on any fault until the adapter is stopped.
async fn run_reader(
    shared: Arc<Shared>,
    mut read: ReadHalf<WireStream>,
    inbox: Sender<WireMessage>,
    mut reset_rx: watch::Receiver<u64>,
) {
    loop {
        loop {
            let frame = tokio::select! {
                frame = wire::read_frame::<_, ServerFrame>(&mut read) => frame,
                _ = reset_rx.changed() => break,
            };

            match frame {
                Ok(ServerFrame::Msg {
                    subject,
                    reply_to,
                    payload,
                }) => {
                    if inbox
                        .send(WireMessage {
                            subject,
                            reply_to,
                            payload,
                        })
                        .is_err()
                    {
                        // adapter dropped, nothing left to deliver to
                        shared.stopped.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                Err(e) => {
                    if !shared.stopped.load(Ordering::SeqCst) {
                        warn!(
                            transport = %shared.options.name,
                            error = %e,
                            "connection lost"
                        );
                    }
                    break;
                }
            }
        }

        *shared.connected.lock() = None;
        shared.writer.lock().await.take();

        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        match establish(&shared).await {
            Ok(new_read) => {
                read = new_read;
                // discard resets that fired while we were reconnecting
                reset_rx.borrow_and_update();
            }
            Err(_) => return,
        }
    }
}

/// Connector producing network-backed adapters, one fresh connection per call
pub struct NetConnector {
    options: TransportOptions,
}

impl NetConnector {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

impl Connector for NetConnector {
    fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        Ok(Arc::new(TransportAdapter::start(self.options.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_adapter_subscribes_and_receives() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        rt.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = tokio::io::split(stream);

            let connect: ClientFrame = wire::read_frame(&mut read).await.unwrap();
            assert!(matches!(connect, ClientFrame::Connect { .. }));

            let sub: ClientFrame = wire::read_frame(&mut read).await.unwrap();
            let subject = match sub {
                ClientFrame::Sub {
                    subject,
                    queue_group,
                    ..
                } => {
                    assert_eq!(queue_group.as_deref(), Some("prod_collective"));
                    subject
                }
                other => panic!("expected Sub, got {:?}", other),
            };

            wire::write_frame(
                &mut write,
                &ServerFrame::Msg {
                    subject,
                    reply_to: None,
                    payload: b"hello".to_vec(),
                },
            )
            .await
            .unwrap();

            // hold the connection open until the client is done
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let adapter =
            TransportAdapter::start(TransportOptions::new("test", vec![addr.to_string()]))
                .unwrap();

        assert_eq!(adapter.connected_server(), addr.to_string());

        adapter
            .subscribe("choria.federation.prod.collective", Some("prod_collective"))
            .unwrap();
        // second subscribe for the same subject is a no-op
        adapter
            .subscribe("choria.federation.prod.collective", Some("prod_collective"))
            .unwrap();

        let msg = adapter.receive().unwrap();
        assert_eq!(msg.subject, "choria.federation.prod.collective");
        assert_eq!(msg.payload, b"hello");

        adapter.stop();
        assert_eq!(adapter.connected_server(), DISCONNECTED);
        assert!(matches!(adapter.receive(), Err(TransportError::Stopped)));
    }

    #[test]
    fn test_start_requires_servers() {
        let result = TransportAdapter::start(TransportOptions::new("empty", vec![]));
        assert!(matches!(result, Err(TransportError::Config(_))));
    }
}
