//! ==============================================================================
//! server.rs - connection handling and monitor lifecycle
//! ==============================================================================
//!
//! purpose:
//!     - ConnectionAcceptor: accepts TCP clients, registers their write half
//!       and spawns one reader per connection.
//!     - ConnectionReader: turns request lines into update events.
//!     - MonitorServer: wires store, settings, queue, writer, sampler and
//!       acceptor together, and tears them down in order.
//!
//! task layout:
//!
//! ```text
//!     sampler ──┐
//!     reader 1 ─┼──> dispatch queue (24) ──> broadcast writer ──> client sinks
//!     reader N ─┘                                  │
//!                                                  └──> export tasks (detached)
//! ```
//!
//! ==============================================================================

use crate::config::HostConfig;
use crate::error::{ProtocolError, QueueClosed};
use crate::hal::Peripherals;
use crate::protocol::{parse_line, Command};
use crate::queue::{dispatch_queue, EventSender, Op, UpdateEvent};
use crate::registry::{client_sink, ClientRegistry, ConnId};
use crate::sampler::{Sampler, SamplerExit};
use crate::settings::{self, SharedSettings};
use crate::store::TelemetryStore;
use crate::writer::BroadcastWriter;

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// served when the configured dashboard page cannot be read
const EMBEDDED_PAGE: &str = include_str!("../web/main.html");

/// longest request or header line a client may send
pub const MAX_REQUEST_LINE: usize = 2048;

// ==============================================================================
// reader
// ==============================================================================

enum RequestLine {
    Eof,
    Line(String),
    /// the first MAX_REQUEST_LINE bytes of a longer line
    Oversized(String),
}

/// reads one connection's requests and queues the matching events
pub struct ConnectionReader<R> {
    conn: ConnId,
    lines: BufReader<R>,
    registry: Arc<ClientRegistry>,
    events: EventSender,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(conn: ConnId, read_half: R, registry: Arc<ClientRegistry>, events: EventSender) -> Self {
        Self { conn, lines: BufReader::new(read_half), registry, events }
    }

    /// read until EOF, error or shutdown, then deregister and close the sink
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = Vec::with_capacity(MAX_REQUEST_LINE);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                read = self.next_line(&mut buf) => read,
                _ = shutdown.changed() => break,
            };
            let queued = match read {
                Ok(RequestLine::Eof) => break,
                Ok(RequestLine::Line(line)) => self.on_line(&line).await,
                Ok(RequestLine::Oversized(head)) => self.on_oversized(&head).await,
                Err(e) => {
                    tracing::debug!("{} read error: {}", self.conn, e);
                    break;
                }
            };
            if queued.is_err() {
                break;
            }
        }

        if let Some(sink) = self.registry.remove(self.conn).await {
            let _ = sink.lock().await.shutdown().await;
        }
        tracing::debug!("{} closed", self.conn);
    }

    /// one line of at most MAX_REQUEST_LINE bytes, decoded lossily
    ///
    /// the rest of a longer line is read and dropped.
    async fn next_line(&mut self, buf: &mut Vec<u8>) -> std::io::Result<RequestLine> {
        buf.clear();
        let n = (&mut self.lines).take(MAX_REQUEST_LINE as u64).read_until(b'\n', buf).await?;
        if n == 0 {
            return Ok(RequestLine::Eof);
        }
        let text = String::from_utf8_lossy(buf).into_owned();
        if n < MAX_REQUEST_LINE || buf.ends_with(b"\n") {
            return Ok(RequestLine::Line(text));
        }

        let mut rest = Vec::with_capacity(MAX_REQUEST_LINE);
        loop {
            rest.clear();
            let n = (&mut self.lines).take(MAX_REQUEST_LINE as u64).read_until(b'\n', &mut rest).await?;
            if n == 0 || rest.ends_with(b"\n") {
                return Ok(RequestLine::Oversized(text));
            }
        }
    }

    /// a too-long request line gets the error response; long headers are ignored
    async fn on_oversized(&self, head: &str) -> Result<(), QueueClosed> {
        if parse_line(head).is_none() {
            return Ok(());
        }
        tracing::debug!("{} rejected request longer than {} bytes", self.conn, MAX_REQUEST_LINE);
        self.events.push(UpdateEvent::reply(self.conn, Op::Error)).await
    }

    /// queue the event for one inbound line; header lines queue nothing
    pub async fn on_line(&self, line: &str) -> Result<(), QueueClosed> {
        let Some(parsed) = parse_line(line) else { return Ok(()) };
        let event = match parsed {
            Ok(command) => self.resolve(command).await,
            Err(e) => Err(e),
        };
        let event = event.unwrap_or_else(|e| {
            tracing::debug!("{} rejected request {:?}: {}", self.conn, line.trim_end(), e);
            UpdateEvent::reply(self.conn, Op::Error)
        });
        self.events.push(event).await
    }

    async fn resolve(&self, command: Command) -> Result<UpdateEvent, ProtocolError> {
        let conn = self.conn;
        Ok(match command {
            Command::Page => UpdateEvent::reply(conn, Op::Page),
            Command::Subscribe { id } => {
                self.registry.set_correlation(conn, id).await;
                UpdateEvent::reply(conn, Op::Subscribe)
            }
            Command::ChangeWarnings(thresholds) => UpdateEvent::global(conn, Op::Warnings(thresholds)),
            Command::ChangeSound(song) => UpdateEvent::global(conn, Op::Sound(song)),
            Command::SetDisplaySchedule(schedule) => UpdateEvent::global(conn, Op::DisplaySchedule(schedule)),
            Command::SwitchMetric { metric, id } => {
                UpdateEvent::addressed(conn, self.client(id).await?, Op::SwitchMetric(metric))
            }
            Command::ChangeScale { scale, id } => {
                UpdateEvent::addressed(conn, self.client(id).await?, Op::ChangeScale(scale))
            }
            Command::Export => UpdateEvent::reply(conn, Op::Export),
            Command::Purge => UpdateEvent::reply(conn, Op::Purge),
        })
    }

    async fn client(&self, id: u32) -> Result<ConnId, ProtocolError> {
        self.registry.find_by_correlation(id).await.ok_or(ProtocolError::UnknownClient(id))
    }
}

// ==============================================================================
// acceptor
// ==============================================================================

pub struct ConnectionAcceptor {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    events: EventSender,
}

impl ConnectionAcceptor {
    pub fn new(listener: TcpListener, registry: Arc<ClientRegistry>, events: EventSender) -> Self {
        Self { listener, registry, events }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let (read_half, write_half) = stream.into_split();
                    let conn = self.registry.insert(client_sink(write_half)).await;
                    tracing::debug!("{} accepted from {}", conn, peer);
                    let reader =
                        ConnectionReader::new(conn, read_half, Arc::clone(&self.registry), self.events.clone());
                    tokio::spawn(reader.run(shutdown.clone()));
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        tracing::debug!("Acceptor stopped");
    }
}

// ==============================================================================
// lifecycle
// ==============================================================================

/// a running monitor: every task plus what shutdown needs to persist
pub struct MonitorServer {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    sampler: JoinHandle<SamplerExit>,
    writer: JoinHandle<TelemetryStore>,
    registry: Arc<ClientRegistry>,
    settings: SharedSettings,
    settings_path: PathBuf,
    power_off: Arc<Notify>,
}

impl MonitorServer {
    pub async fn start(config: &HostConfig, peripherals: Peripherals) -> Result<Self> {
        let page: Arc<str> = match tokio::fs::read_to_string(&config.server.page).await {
            Ok(page) => Arc::from(page),
            Err(e) => {
                tracing::warn!("Dashboard page {} unavailable ({}) - using embedded page", config.server.page.display(), e);
                Arc::from(EMBEDDED_PAGE)
            }
        };

        let settings_path = config.storage.settings_path();
        let settings = settings::shared(settings::load_or_default(&settings_path));
        let store = TelemetryStore::open(config.storage.readings_path())?;

        let listener = TcpListener::bind(&config.server.bind)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", config.server.bind, e))?;
        let local_addr = listener.local_addr()?;

        let Peripherals { co2, climate, display, alarm, storage } = peripherals;
        let (events, queue) = dispatch_queue();
        let registry = Arc::new(ClientRegistry::new());
        let (stop, shutdown) = watch::channel(false);
        let power_off = Arc::new(Notify::new());

        let writer = BroadcastWriter::new(
            queue,
            Arc::clone(&registry),
            Arc::clone(&settings),
            store,
            storage,
            page,
            config.polling.interval_ms as u32,
        );
        let writer = tokio::spawn(writer.run());

        let sampler = Sampler::new(co2, climate, display, alarm, Arc::clone(&settings), events.clone(), &config.polling)
            .show_sensor_data(config.logging.show_sensor_data)
            .on_power_off(Arc::clone(&power_off));
        let sampler = tokio::spawn(sampler.run(shutdown.clone()));

        let acceptor = ConnectionAcceptor::new(listener, Arc::clone(&registry), events);
        let acceptor = tokio::spawn(acceptor.run(shutdown));

        tracing::info!("[SERVER] Dashboard live at http://{}", local_addr);
        Ok(Self { local_addr, stop, acceptor, sampler, writer, registry, settings, settings_path, power_off })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// resolves once the display asked to power the device off
    pub async fn power_off_requested(&self) {
        self.power_off.notified().await;
    }

    /// stop every task, persist pending readings and the settings
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("[SERVER] Shutting down");
        let _ = self.stop.send(true);

        if let Err(e) = self.acceptor.await {
            tracing::warn!("Acceptor task failed: {}", e);
        }
        match self.sampler.await {
            Ok(exit) => tracing::debug!("Sampler finished: {:?}", exit),
            Err(e) => tracing::warn!("Sampler task failed: {}", e),
        }

        // readers exit on the stop signal; the writer drains what they queued
        let mut store = self.writer.await?;

        for sink in self.registry.drain().await {
            let _ = sink.lock().await.shutdown().await;
        }

        store.sync().await?;
        let settings = *self.settings.read().await;
        settings::save(&self.settings_path, &settings)?;
        tracing::info!("[SERVER] Readings and settings saved");
        Ok(())
    }
}
