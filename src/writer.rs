//! ==============================================================================
//! writer.rs - the broadcast writer
//! ==============================================================================
//!
//! purpose:
//!     the single consumer of the dispatch queue. applies each update event
//!     to shared state and fans the resulting frames out to clients.
//!
//! responsibilities:
//!     - sensor ticks: persist every 5 s, push readings to ready clients,
//!       chart updates at each client's scale period, storage stats every minute.
//!     - global settings: mutate, broadcast, acknowledge a non-ready source.
//!     - per-client chart changes, subscription bootstrap, page, errors.
//!     - readings-log purge and spawning detached exports.
//!
//! delivery:
//!     best effort. a failed write is logged and skipped; the connection's
//!     reader notices the dead socket and deregisters it.
//!
//! ==============================================================================

use crate::domain::{Reading, Sample};
use crate::export;
use crate::hal::StorageProbe;
use crate::protocol::{self, OK_RESPONSE, STREAM_HEAD};
use crate::queue::{EventReceiver, Op, UpdateEvent};
use crate::registry::{self, ClientRegistry, ClientSink, ConnId, Subscription};
use crate::settings::SharedSettings;
use crate::store::TelemetryStore;

use std::sync::Arc;

/// readings are persisted every 5 s
const PERSIST_PERIOD_MS: u32 = 5_000;

/// storage statistics refresh
const STORAGE_PERIOD_MS: u32 = 60_000;

/// longest chart update period; the tick counter wraps here
pub const CYCLE_MS: u32 = 2_160_000;

pub struct BroadcastWriter {
    queue: EventReceiver,
    registry: Arc<ClientRegistry>,
    settings: SharedSettings,
    store: TelemetryStore,
    storage: Arc<dyn StorageProbe>,
    page: Arc<str>,
    tick_ms: u32,
    elapsed_ms: u32,
}

impl BroadcastWriter {
    pub fn new(
        queue: EventReceiver,
        registry: Arc<ClientRegistry>,
        settings: SharedSettings,
        store: TelemetryStore,
        storage: Arc<dyn StorageProbe>,
        page: Arc<str>,
        tick_ms: u32,
    ) -> Self {
        Self { queue, registry, settings, store, storage, page, tick_ms, elapsed_ms: 0 }
    }

    /// consume events until every producer is gone; hands the store back
    pub async fn run(mut self) -> TelemetryStore {
        while let Some(event) = self.queue.pop().await {
            self.handle(event).await;
        }
        tracing::debug!("Dispatch queue closed - writer stopping");
        self.store
    }

    pub async fn handle(&mut self, event: UpdateEvent) {
        let UpdateEvent { target, source, op } = event;
        match op {
            Op::Sample(sample) => {
                self.on_sample(sample).await;
                if self.elapsed_ms >= CYCLE_MS {
                    self.elapsed_ms = 0;
                }
                self.elapsed_ms += self.tick_ms;
            }
            Op::Warnings(thresholds) => {
                self.settings.write().await.thresholds = thresholds;
                self.broadcast_setting(source, protocol::warnings_frame(&thresholds)).await;
            }
            Op::Sound(song) => {
                self.settings.write().await.alarm = song;
                self.broadcast_setting(source, protocol::sound_frame(song)).await;
            }
            Op::DisplaySchedule(schedule) => {
                self.settings.write().await.display = schedule;
                self.broadcast_setting(source, protocol::lcd_times_frame(&schedule)).await;
            }
            Op::SwitchMetric(metric) => {
                self.change_chart(source, target, |s| s.metric = metric, protocol::chart_switch_frame(metric))
                    .await;
            }
            Op::ChangeScale(scale) => {
                self.change_chart(source, target, |s| s.scale = scale, protocol::chart_scale_frame(scale))
                    .await;
            }
            Op::Subscribe => {
                if let Some(conn) = target {
                    self.bootstrap(conn).await;
                }
            }
            Op::Page => {
                let page = protocol::page_response(&self.page);
                self.send_to(target, page.as_bytes()).await;
            }
            Op::Error => {
                self.send_to(target, protocol::not_found_response().as_bytes()).await;
            }
            Op::Purge => self.purge(target).await,
            Op::Export => self.start_export(target).await,
        }
    }

    /// current position in the update cycle
    pub fn elapsed_ms(&self) -> u32 {
        self.elapsed_ms
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    async fn on_sample(&mut self, sample: Sample) {
        if self.elapsed_ms % PERSIST_PERIOD_MS == 0 {
            let now = chrono::Utc::now().timestamp().max(0) as u32;
            self.store.append(Reading::from_sample(now, &sample));
        }

        let storage = (self.elapsed_ms % STORAGE_PERIOD_MS == 0)
            .then(|| protocol::storage_frame(&self.storage.usage()));
        let readings = protocol::readings_frame(&sample);

        for client in self.registry.ready_clients().await {
            let sub = client.subscription;
            let mut frame = String::new();
            if self.elapsed_ms % sub.scale.update_period_ms() == 0 {
                frame.push_str(&protocol::data_upd_frame(sample.value(sub.metric)));
            }
            frame.push_str(&readings);
            if let Some(storage) = &storage {
                frame.push_str(storage);
            }
            deliver(client.conn, &client.sink, frame.as_bytes()).await;
        }
    }

    /// ready clients get the new value; a non-ready source only an ack
    async fn broadcast_setting(&self, source: Option<ConnId>, frame: String) {
        let ready = self.registry.ready_clients().await;
        for client in &ready {
            deliver(client.conn, &client.sink, frame.as_bytes()).await;
        }
        if let Some(source) = source.filter(|s| !ready.iter().any(|c| c.conn == *s)) {
            self.send_to(Some(source), OK_RESPONSE.as_bytes()).await;
        }
    }

    async fn change_chart<F>(&self, source: Option<ConnId>, target: Option<ConnId>, change: F, head: String)
    where
        F: FnOnce(&mut Subscription),
    {
        let Some(target) = target else { return };
        match self.registry.update_subscription(target, change).await {
            Some(sub) => {
                let mut frame = head;
                frame.push_str(&protocol::data_frame(&self.store.series(sub.metric, sub.scale)));
                frame.push_str(&protocol::chart_vars_frame(sub.scale));
                self.send_to(Some(target), frame.as_bytes()).await;
            }
            None => tracing::debug!("Chart change for {} dropped: client gone", target),
        }
        if source.is_some() && source != Some(target) {
            self.send_to(source, OK_RESPONSE.as_bytes()).await;
        }
    }

    async fn bootstrap(&self, conn: ConnId) {
        let Some(client) = self.registry.get(conn).await else { return };
        let settings = *self.settings.read().await;
        let sub = client.subscription;

        let mut frame = String::from(STREAM_HEAD);
        frame.push_str(&protocol::warnings_frame(&settings.thresholds));
        frame.push_str(&protocol::storage_frame(&self.storage.usage()));
        frame.push_str(&protocol::sound_frame(settings.alarm));
        frame.push_str(&protocol::chart_switch_frame(sub.metric));
        frame.push_str(&protocol::chart_scale_frame(sub.scale));
        frame.push_str(&protocol::data_frame(&self.store.series(sub.metric, sub.scale)));
        frame.push_str(&protocol::chart_vars_frame(sub.scale));
        frame.push_str(&protocol::lcd_times_frame(&settings.display));
        deliver(conn, &client.sink, frame.as_bytes()).await;

        self.registry.update_subscription(conn, |s| s.ready = true).await;
        tracing::debug!("{} subscribed", conn);
    }

    async fn purge(&self, target: Option<ConnId>) {
        self.send_to(target, OK_RESPONSE.as_bytes()).await;
        match self.store.purge().await {
            Ok(()) => tracing::info!("Readings log purged"),
            Err(e) => tracing::warn!("Readings log purge failed: {}", e),
        }
        let frame = protocol::storage_frame(&self.storage.usage());
        for client in self.registry.ready_clients().await {
            deliver(client.conn, &client.sink, frame.as_bytes()).await;
        }
    }

    async fn start_export(&self, target: Option<ConnId>) {
        let Some((conn, sink)) = self.sink_of(target).await else { return };
        let log = self.store.log();
        tokio::spawn(async move {
            match export::stream_export(log, sink).await {
                Ok(bytes) => tracing::info!("Exported {} bytes of readings to {}", bytes, conn),
                Err(e) => tracing::debug!("Export to {} aborted: {}", conn, e),
            }
        });
    }

    async fn sink_of(&self, conn: Option<ConnId>) -> Option<(ConnId, ClientSink)> {
        let view = self.registry.get(conn?).await?;
        Some((view.conn, view.sink))
    }

    async fn send_to(&self, conn: Option<ConnId>, bytes: &[u8]) {
        if let Some((conn, sink)) = self.sink_of(conn).await {
            deliver(conn, &sink, bytes).await;
        }
    }
}

async fn deliver(conn: ConnId, sink: &ClientSink, bytes: &[u8]) {
    if let Err(e) = registry::send(sink, bytes).await {
        tracing::debug!("Write to {} failed: {}", conn, e);
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlarmSong, ClockTime, DisplaySchedule, GlobalSettings, Metric, Scale, Thresholds};
    use crate::hal::StorageUsage;
    use crate::queue::{dispatch_queue, EventSender};
    use crate::registry::client_sink;
    use crate::settings;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct FixedDisk;

    impl StorageProbe for FixedDisk {
        fn usage(&self) -> StorageUsage {
            StorageUsage { free_gb: 10.0, total_gb: 20.0 }
        }
    }

    struct Harness {
        writer: BroadcastWriter,
        registry: Arc<ClientRegistry>,
        settings: SharedSettings,
        _tx: EventSender,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = dispatch_queue();
        let registry = Arc::new(ClientRegistry::new());
        let settings = settings::shared(GlobalSettings::default());
        let store = TelemetryStore::open(dir.path().join("readings.rws")).unwrap();
        let writer = BroadcastWriter::new(
            rx,
            Arc::clone(&registry),
            Arc::clone(&settings),
            store,
            Arc::new(FixedDisk),
            Arc::from("<html>dash</html>"),
            1_000,
        );
        Harness { writer, registry, settings, _tx: tx, _dir: dir }
    }

    async fn connect(registry: &ClientRegistry) -> (ConnId, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let conn = registry.insert(client_sink(ours)).await;
        (conn, theirs)
    }

    /// everything written so far, without waiting for more
    async fn drain(stream: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    fn event_names(text: &str) -> Vec<&str> {
        text.lines().filter_map(|l| l.strip_prefix("event: ")).collect()
    }

    fn tick(ppm: u16) -> UpdateEvent {
        UpdateEvent::sample(Sample { co2_ppm: ppm, humidity: 41.5, temperature: 22.3 })
    }

    #[tokio::test]
    async fn test_bootstrap_order_then_ready() {
        let mut h = harness();
        let (conn, mut client) = connect(&h.registry).await;

        h.writer.handle(UpdateEvent::reply(conn, Op::Subscribe)).await;
        let text = drain(&mut client).await;
        assert!(text.starts_with(STREAM_HEAD));
        assert_eq!(
            event_names(&text),
            ["warnings", "storage", "sound", "chart_switch", "chart_scale", "data", "chart_vars", "lcd_times"]
        );
        assert!(text.contains("event: warnings\ndata: 1000,30,50,20,27\n\n"));
        assert!(text.contains("event: storage\ndata: 1,10.0\n\n"));
        assert!(text.contains("event: chart_vars\ndata: 60,0.083333\n\n"));
        assert!(h.registry.get(conn).await.unwrap().subscription.ready);
    }

    #[tokio::test]
    async fn test_tick_cadence() {
        let mut h = harness();
        let (conn, mut client) = connect(&h.registry).await;
        h.writer.handle(UpdateEvent::reply(conn, Op::Subscribe)).await;
        drain(&mut client).await;

        // elapsed 0: chart update, readings, storage
        h.writer.handle(tick(700)).await;
        let text = drain(&mut client).await;
        assert_eq!(event_names(&text), ["data_upd", "readings", "storage"]);
        assert!(text.contains("event: data_upd\ndata: 700\n\n"));
        assert!(text.contains("event: readings\ndata: 700,41.5,22.3\n\n"));
        assert_eq!(h.writer.store().pending(), 1);

        // elapsed 1000..4000: readings only, nothing persisted
        for _ in 0..4 {
            h.writer.handle(tick(701)).await;
            assert_eq!(event_names(&drain(&mut client).await), ["readings"]);
        }
        assert_eq!(h.writer.store().pending(), 1);

        // elapsed 5000: five-minute chart update and a persisted reading
        h.writer.handle(tick(702)).await;
        assert_eq!(event_names(&drain(&mut client).await), ["data_upd", "readings"]);
        assert_eq!(h.writer.store().pending(), 2);
        assert_eq!(h.writer.elapsed_ms(), 6_000);
    }

    #[tokio::test]
    async fn test_only_samples_advance_the_counter() {
        let mut h = harness();
        let (conn, _client) = connect(&h.registry).await;
        h.writer.handle(tick(700)).await;
        h.writer.handle(UpdateEvent::global(conn, Op::Sound(AlarmSong::Doom))).await;
        h.writer.handle(UpdateEvent::reply(conn, Op::Page)).await;
        assert_eq!(h.writer.elapsed_ms(), 1_000);
    }

    #[tokio::test]
    async fn test_counter_wraps_at_cycle() {
        let mut h = harness();
        h.writer.elapsed_ms = CYCLE_MS;
        h.writer.handle(tick(700)).await;
        assert_eq!(h.writer.elapsed_ms(), 1_000);
    }

    #[tokio::test]
    async fn test_warnings_broadcast_and_ack() {
        let mut h = harness();
        let (a, mut client_a) = connect(&h.registry).await;
        let (b, mut client_b) = connect(&h.registry).await;
        let (source, mut requester) = connect(&h.registry).await;
        for conn in [a, b] {
            h.writer.handle(UpdateEvent::reply(conn, Op::Subscribe)).await;
        }
        drain(&mut client_a).await;
        drain(&mut client_b).await;

        let thresholds = Thresholds { co2: 900, humidity_low: 30, humidity_high: 50, temp_low: 20, temp_high: 27 };
        h.writer.handle(UpdateEvent::global(source, Op::Warnings(thresholds))).await;

        let expected = "event: warnings\ndata: 900,30,50,20,27\n\n";
        assert_eq!(drain(&mut client_a).await, expected);
        assert_eq!(drain(&mut client_b).await, expected);
        assert_eq!(drain(&mut requester).await, OK_RESPONSE);
        assert_eq!(h.settings.read().await.thresholds, thresholds);
    }

    #[tokio::test]
    async fn test_ready_source_gets_broadcast_only() {
        let mut h = harness();
        let (conn, mut client) = connect(&h.registry).await;
        h.writer.handle(UpdateEvent::reply(conn, Op::Subscribe)).await;
        drain(&mut client).await;

        let schedule = DisplaySchedule {
            on: ClockTime::new(7, 0).unwrap(),
            off: ClockTime::new(23, 0).unwrap(),
        };
        h.writer.handle(UpdateEvent::global(conn, Op::DisplaySchedule(schedule))).await;
        assert_eq!(drain(&mut client).await, "event: lcd_times\ndata: 07:00,23:00\n\n");
        assert_eq!(h.settings.read().await.display, schedule);
    }

    #[tokio::test]
    async fn test_switch_and_scale_for_correlated_client() {
        let mut h = harness();
        let (target, mut stream) = connect(&h.registry).await;
        let (source, mut requester) = connect(&h.registry).await;
        h.registry.set_correlation(target, 7).await;
        h.writer.handle(UpdateEvent::reply(target, Op::Subscribe)).await;
        drain(&mut stream).await;

        h.writer.handle(UpdateEvent::addressed(source, target, Op::SwitchMetric(Metric::Humidity))).await;
        let text = drain(&mut stream).await;
        assert_eq!(event_names(&text), ["chart_switch", "data", "chart_vars"]);
        assert!(text.starts_with("event: chart_switch\ndata: humd_chart\n\n"));
        assert_eq!(drain(&mut requester).await, OK_RESPONSE);

        h.writer.handle(UpdateEvent::addressed(source, target, Op::ChangeScale(Scale::OneHour))).await;
        let text = drain(&mut stream).await;
        assert!(text.starts_with("event: chart_scale\ndata: 1h\n\n"));
        let data = text.lines().skip_while(|l| *l != "event: data").nth(1).unwrap();
        assert_eq!(data.trim_start_matches("data: ").split(',').count(), 30);
        assert!(text.ends_with("event: chart_vars\ndata: 30,2\n\n"));
        drain(&mut requester).await;

        let sub = h.registry.get(target).await.unwrap().subscription;
        assert_eq!((sub.metric, sub.scale), (Metric::Humidity, Scale::OneHour));

        // the hour scale gets chart updates every two minutes only
        h.writer.elapsed_ms = 5_000;
        h.writer.handle(tick(800)).await;
        assert_eq!(event_names(&drain(&mut stream).await), ["readings"]);
        h.writer.elapsed_ms = 120_000;
        h.writer.handle(tick(800)).await;
        let text = drain(&mut stream).await;
        assert_eq!(event_names(&text), ["data_upd", "readings", "storage"]);
        assert!(text.starts_with("event: data_upd\ndata: 41.5\n\n"));
    }

    #[tokio::test]
    async fn test_self_addressed_switch_has_no_ack() {
        let mut h = harness();
        let (conn, mut stream) = connect(&h.registry).await;
        h.writer.handle(UpdateEvent::reply(conn, Op::SwitchMetric(Metric::Temperature))).await;
        let text = drain(&mut stream).await;
        assert!(!text.contains("HTTP/1.1"));
        assert_eq!(event_names(&text), ["chart_switch", "data", "chart_vars"]);
    }

    #[tokio::test]
    async fn test_purge_acks_then_broadcasts_storage() {
        let mut h = harness();
        let (watcher, mut watching) = connect(&h.registry).await;
        let (source, mut requester) = connect(&h.registry).await;
        h.writer.handle(UpdateEvent::reply(watcher, Op::Subscribe)).await;
        drain(&mut watching).await;

        h.writer.handle(UpdateEvent::reply(source, Op::Purge)).await;
        assert_eq!(drain(&mut requester).await, OK_RESPONSE);
        assert_eq!(drain(&mut watching).await, "event: storage\ndata: 1,10.0\n\n");
    }

    #[tokio::test]
    async fn test_page_and_error() {
        let mut h = harness();
        let (conn, mut stream) = connect(&h.registry).await;
        h.writer.handle(UpdateEvent::reply(conn, Op::Page)).await;
        assert!(drain(&mut stream).await.ends_with("\n\n<html>dash</html>"));
        h.writer.handle(UpdateEvent::reply(conn, Op::Error)).await;
        assert!(drain(&mut stream).await.starts_with("HTTP/1.1 404 Not Found\n"));
    }

    #[tokio::test]
    async fn test_export_streams_log() {
        let mut h = harness();
        for _ in 0..crate::store::FLUSH_INTERVAL * 5 {
            h.writer.handle(tick(650)).await;
        }
        let (conn, mut stream) = connect(&h.registry).await;
        h.writer.handle(UpdateEvent::reply(conn, Op::Export)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        let split = raw.windows(2).position(|w| w == b"\n\n").unwrap() + 2;
        let head = String::from_utf8_lossy(&raw[..split]);
        let body_len = (crate::store::FLUSH_INTERVAL * crate::store::RECORD_SIZE) as u64;
        assert!(head.contains("application/octet-stream"));
        assert!(head.contains(&format!("Content-Length: {}\n", body_len)));
        assert!(head.contains("__"));
        assert_eq!((raw.len() - split) as u64, body_len);
    }

    #[tokio::test]
    async fn test_run_drains_then_returns_store() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = dispatch_queue();
        let writer = BroadcastWriter::new(
            rx,
            Arc::new(ClientRegistry::new()),
            settings::shared(GlobalSettings::default()),
            TelemetryStore::open(dir.path().join("readings.rws")).unwrap(),
            Arc::new(FixedDisk),
            Arc::from(""),
            1_000,
        );
        let task = tokio::spawn(writer.run());
        for _ in 0..10 {
            tx.push(tick(600)).await.unwrap();
        }
        drop(tx);
        let store = task.await.unwrap();
        assert_eq!(store.pending(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_setting_changes_stay_whole() {
        let Harness { writer, registry, settings, _tx: tx, _dir } = harness();
        let a = registry.insert(client_sink(tokio::io::sink())).await;
        let b = registry.insert(client_sink(tokio::io::sink())).await;
        let writer = tokio::spawn(writer.run());

        let strict = Thresholds { co2: 800, humidity_low: 20, humidity_high: 40, temp_low: 15, temp_high: 22 };
        let lenient = Thresholds { co2: 1500, humidity_low: 45, humidity_high: 70, temp_low: 24, temp_high: 30 };
        let early = DisplaySchedule { on: ClockTime { hour: 6, minute: 0 }, off: ClockTime { hour: 21, minute: 0 } };
        let late = DisplaySchedule { on: ClockTime { hour: 9, minute: 30 }, off: ClockTime { hour: 23, minute: 45 } };

        let producer = |conn: ConnId, thresholds: Thresholds, schedule: DisplaySchedule| {
            let tx = tx.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    tx.push(UpdateEvent::global(conn, Op::Warnings(thresholds))).await.unwrap();
                    tx.push(UpdateEvent::global(conn, Op::DisplaySchedule(schedule))).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let first = producer(a, strict, early);
        let second = producer(b, lenient, late);

        let observer = {
            let settings = Arc::clone(&settings);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..2_000 {
                    seen.push(*settings.read().await);
                    tokio::task::yield_now().await;
                }
                seen
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        let seen = observer.await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let defaults = GlobalSettings::default();
        for snapshot in seen.iter().chain([*settings.read().await].iter()) {
            let t = snapshot.thresholds;
            assert!(t == strict || t == lenient || t == defaults.thresholds, "torn thresholds {:?}", t);
            let d = snapshot.display;
            assert!(d == early || d == late || d == defaults.display, "torn schedule {:?}", d);
        }
        let last = *settings.read().await;
        assert!(last.thresholds == strict || last.thresholds == lenient);
    }
}
