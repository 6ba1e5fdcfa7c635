//! ==============================================================================
//! store.rs - telemetry ring and readings log
//! ==============================================================================
//!
//! purpose:
//!     keeps the last 24h of 5-second readings in memory (the ring) and
//!     mirrors them into an append-only readings log on disk.
//!
//! structure:
//!     - RingLog: fixed-capacity circular history with offset lookup.
//!     - LogFile: the readings log behind ONE exclusive lock, shared by
//!       background flushes, bulk exports and purges.
//!     - TelemetryStore: ring + flush backlog + log; owned by the writer.
//!
//! flush policy:
//!     every FLUSH_INTERVAL appends the store TRIES the log lock. on success
//!     the whole unflushed backlog is written oldest-first. on contention
//!     (an export holds the lock) nothing blocks: the backlog simply grows
//!     and the next successful flush covers it. the backlog is capped at the
//!     ring capacity, past that the oldest unflushed readings are gone.
//!
//! record layout:
//!     8 bytes little-endian: u32 unix timestamp, u32 packed reading
//!     (see domain.rs for the packing).
//!
//! ==============================================================================

use crate::domain::{Metric, Reading, Scale};
use crate::error::StoreError;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 24 hours of readings taken every 5 seconds
pub const RING_CAPACITY: usize = 17_280;

/// appends between flush attempts (5 minutes at 5 s cadence)
pub const FLUSH_INTERVAL: usize = 60;

/// bytes per persisted record
pub const RECORD_SIZE: usize = 8;

fn encode(reading: &Reading) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[..4].copy_from_slice(&reading.timestamp.to_le_bytes());
    buf[4..].copy_from_slice(&reading.pack().to_le_bytes());
    buf
}

fn decode(buf: &[u8]) -> Reading {
    let timestamp = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let packed = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Reading::unpack(timestamp, packed)
}

// ==============================================================================
// ring log
// ==============================================================================

/// fixed-capacity circular history
#[derive(Debug, Clone)]
pub struct RingLog {
    entries: Vec<Reading>,
    cursor: usize,
}

impl RingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![Reading::default(); capacity.max(1)],
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, reading: Reading) {
        self.entries[self.cursor] = reading;
        self.cursor = (self.cursor + 1) % self.entries.len();
    }

    /// entry written `offset + 1` pushes before the most recent one
    pub fn lookup(&self, offset: usize) -> Result<Reading, StoreError> {
        let capacity = self.entries.len();
        if offset >= capacity {
            return Err(StoreError::OffsetOutOfRange { offset, capacity });
        }
        Ok(self.entries[(self.cursor + capacity - offset - 1) % capacity])
    }

    fn clear(&mut self) {
        self.entries.fill(Reading::default());
        self.cursor = 0;
    }
}

// ==============================================================================
// readings log
// ==============================================================================

/// handle to the readings log; clones share the same lock
#[derive(Clone)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogFile {
    /// open (creating directories and file as needed) in append mode
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(Self { path, file: Arc::new(Mutex::new(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// read up to `max` most recent whole records, oldest first
    fn read_tail(&self, max: usize) -> std::io::Result<Vec<Reading>> {
        let mut file = File::open(&self.path)?;
        let records = file.metadata()?.len() / RECORD_SIZE as u64;
        let first = records.saturating_sub(max as u64);
        file.seek(SeekFrom::Start(first * RECORD_SIZE as u64))?;

        let mut buf = vec![0u8; ((records - first) as usize) * RECORD_SIZE];
        file.read_exact(&mut buf)?;
        Ok(buf.chunks_exact(RECORD_SIZE).map(decode).collect())
    }

    /// write if the lock is free right now; None when it is held elsewhere
    fn try_write(&self, records: &[Reading]) -> Option<std::io::Result<()>> {
        let mut file = self.file.try_lock().ok()?;
        Some(write_records(&mut file, records))
    }

    async fn write(&self, records: &[Reading]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        write_records(&mut file, records)
    }

    /// truncate the log; waits for any export in progress
    pub async fn purge(&self) -> std::io::Result<()> {
        let file = self.file.lock().await;
        file.set_len(0)?;
        file.sync_data()
    }

    /// exclusive hold on the log for a bulk read; released on drop
    pub async fn lock_export(&self) -> ExportLock {
        ExportLock {
            guard: Arc::clone(&self.file).lock_owned().await,
            path: self.path.clone(),
        }
    }
}

fn write_records(file: &mut File, records: &[Reading]) -> std::io::Result<()> {
    let buf: Vec<u8> = records.iter().flat_map(encode).collect();
    file.write_all(&buf)?;
    file.flush()
}

/// scoped exclusive acquisition of the readings log
pub struct ExportLock {
    guard: OwnedMutexGuard<File>,
    path: PathBuf,
}

impl ExportLock {
    /// current log size in bytes
    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.guard.metadata()?.len())
    }

    /// timestamps of the first and last whole records, if any
    pub fn bounds(&self) -> std::io::Result<Option<(u32, u32)>> {
        let records = self.len()? / RECORD_SIZE as u64;
        if records == 0 {
            return Ok(None);
        }
        let mut file = File::open(&self.path)?;
        let mut buf = [0u8; RECORD_SIZE];
        file.read_exact(&mut buf)?;
        let first = decode(&buf).timestamp;
        file.seek(SeekFrom::Start((records - 1) * RECORD_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Some((first, decode(&buf).timestamp)))
    }

    /// a fresh read handle positioned at the start of the log
    pub async fn reader(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

// ==============================================================================
// telemetry store
// ==============================================================================

pub struct TelemetryStore {
    ring: RingLog,
    log: LogFile,
    /// ring entries not yet in the log
    unflushed: usize,
    appends_since_attempt: usize,
    overflowing: bool,
}

impl TelemetryStore {
    /// open the readings log and hydrate the ring from its tail
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut store = Self {
            ring: RingLog::new(RING_CAPACITY),
            log: LogFile::open(path)?,
            unflushed: 0,
            appends_since_attempt: 0,
            overflowing: false,
        };
        match store.hydrate() {
            Ok(n) => tracing::info!("Hydrated {} readings from {}", n, store.log.path().display()),
            Err(e) => tracing::warn!("Could not read {}: {} - starting empty", store.log.path().display(), e),
        }
        Ok(store)
    }

    /// reload the ring from the most recent RING_CAPACITY log records
    pub fn hydrate(&mut self) -> Result<usize, StoreError> {
        let tail = self.log.read_tail(self.ring.capacity())?;
        self.ring.clear();
        for reading in &tail {
            self.ring.push(*reading);
        }
        self.unflushed = 0;
        self.appends_since_attempt = 0;
        Ok(tail.len())
    }

    pub fn append(&mut self, reading: Reading) {
        self.ring.push(reading);
        self.unflushed += 1;
        self.appends_since_attempt += 1;

        if self.unflushed > self.ring.capacity() {
            if !self.overflowing {
                tracing::warn!(
                    "Flush backlog exceeds ring capacity ({}); oldest unflushed readings are being lost",
                    self.ring.capacity()
                );
                self.overflowing = true;
            }
            self.unflushed = self.ring.capacity();
        }

        if self.appends_since_attempt >= FLUSH_INTERVAL {
            self.appends_since_attempt = 0;
            self.try_flush();
        }
    }

    fn try_flush(&mut self) {
        let backlog = self.backlog();
        match self.log.try_write(&backlog) {
            Some(Ok(())) => {
                self.unflushed = 0;
                self.overflowing = false;
            }
            Some(Err(e)) => tracing::warn!("Readings flush failed, keeping backlog of {}: {}", self.unflushed, e),
            None => tracing::debug!("Readings log busy, deferring flush (backlog {})", self.unflushed),
        }
    }

    /// unflushed entries, oldest first
    fn backlog(&self) -> Vec<Reading> {
        (0..self.unflushed)
            .rev()
            .filter_map(|offset| self.ring.lookup(offset).ok())
            .collect()
    }

    /// write the whole backlog now, waiting for the lock
    pub async fn sync(&mut self) -> Result<(), StoreError> {
        if self.unflushed == 0 {
            return Ok(());
        }
        let backlog = self.backlog();
        self.log.write(&backlog).await?;
        self.unflushed = 0;
        self.overflowing = false;
        self.appends_since_attempt = 0;
        Ok(())
    }

    pub fn lookup(&self, offset: usize) -> Result<Reading, StoreError> {
        self.ring.lookup(offset)
    }

    /// downsampled chart values for a metric, oldest first
    pub fn series(&self, metric: Metric, scale: Scale) -> Vec<String> {
        let (window, stride) = scale.window();
        (0..window)
            .rev()
            .step_by(stride)
            .filter_map(|offset| self.ring.lookup(offset).ok())
            .map(|reading| reading.format(metric))
            .collect()
    }

    /// ring entries the log has not caught up with yet
    pub fn pending(&self) -> usize {
        self.unflushed
    }

    /// truncate the readings log; the in-memory ring is kept
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.log.purge().await?;
        Ok(())
    }

    pub async fn export_locked(&self) -> ExportLock {
        self.log.lock_export().await
    }

    /// shareable handle for detached export tasks
    pub fn log(&self) -> LogFile {
        self.log.clone()
    }
}
