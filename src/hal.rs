//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     the seams between the monitor core and the devices around it:
//!     co2 + climate sensors, the local display, the alarm buzzer and the
//!     disk holding the readings log.
//!
//! design philosophy:
//!     - "Compile Anywhere": without the `hardware` feature every collaborator
//!       is a mock, so the host builds and runs on any development machine.
//!     - sensor wire drivers and the display renderer live outside this crate;
//!       only their interfaces are defined here.
//!
//! relationships:
//!     - used by: sampler.rs (sensors, display, alarm), writer.rs (storage)
//!     - uses: rppal (on feature="hardware"), sysinfo (disk usage)
//!
//! ==============================================================================

use crate::config::HostConfig;
use crate::domain::{AlarmSong, Sample, Thresholds};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// co2 sensor (request/response over uart on the real device)
pub trait Co2Sensor: Send {
    fn read_ppm(&mut self) -> Result<u16>;
}

/// combined humidity/temperature sensor
pub trait ClimateSensor: Send {
    /// (relative humidity %, temperature celsius)
    fn measure(&mut self) -> Result<(f32, f32)>;
}

/// local screen
pub trait Display: Send + Sync {
    /// draw a completed sample
    fn show(&self, sample: &Sample, thresholds: &Thresholds);
    /// scheduled backlight on/off
    fn set_power(&self, on: bool);
    /// the user asked (via touch) to power the device off
    fn power_off_pending(&self) -> bool;
    /// the host is powering off
    fn power_off_requested(&self);
}

/// alarm playback; blocks for the duration of the song
pub trait Alarm: Send + Sync {
    fn play(&self, song: AlarmSong) -> Result<()>;
}

/// free/total space of the readings-log disk
pub trait StorageProbe: Send + Sync {
    fn usage(&self) -> StorageUsage;
}

/// disk usage in GB, rounded up to one decimal
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StorageUsage {
    pub free_gb: f32,
    pub total_gb: f32,
}

impl StorageUsage {
    pub fn from_bytes(available: u64, total: u64) -> Self {
        let gb = |bytes: u64| ((bytes as f64 / 1e9 * 10.0).ceil() / 10.0) as f32;
        Self { free_gb: gb(available), total_gb: gb(total) }
    }

    /// dashboard gauge value: 0.0 (empty disk) .. 2.0 (full disk)
    pub fn fill(&self) -> f32 {
        if self.total_gb <= 0.0 {
            return 0.0;
        }
        (1.0 - self.free_gb / self.total_gb) * 2.0
    }
}

/// on/off rhythm of each alarm, in (on ms, off ms) pairs
pub fn alarm_pattern(song: AlarmSong) -> &'static [(u32, u32)] {
    match song {
        AlarmSong::None => &[],
        AlarmSong::Beep => &[(200, 0)],
        AlarmSong::Sos => &[
            (150, 150), (150, 150), (150, 300),
            (450, 150), (450, 150), (450, 300),
            (150, 150), (150, 150), (150, 0),
        ],
        AlarmSong::Co2 => &[(600, 300), (600, 300), (600, 0)],
        AlarmSong::ImperialMarch => &[
            (500, 50), (500, 50), (500, 50), (350, 50), (150, 50),
            (500, 50), (350, 50), (150, 50), (1000, 0),
        ],
        AlarmSong::StarTrek => &[(300, 100), (150, 50), (700, 150), (500, 100), (300, 100), (900, 0)],
        AlarmSong::Doom => &[
            (120, 30), (120, 30), (240, 30), (120, 30), (120, 30), (240, 30),
            (120, 30), (120, 30), (480, 0),
        ],
    }
}

// ==============================================================================================
// DISK USAGE (sysinfo)
// ==============================================================================================

/// usage of the disk mounted under `path`
pub struct DiskUsage {
    path: PathBuf,
}

impl DiskUsage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StorageProbe for DiskUsage {
    fn usage(&self) -> StorageUsage {
        use sysinfo::Disks;

        let path = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| StorageUsage::from_bytes(d.available_space(), d.total_space()))
            .unwrap_or_default()
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For Non-Hardware Build)
// ==============================================================================================

/// slowly drifting co2 level
pub struct SimulatedCo2 {
    tick: u32,
}

impl SimulatedCo2 {
    pub fn new() -> Self {
        tracing::info!("Using MOCK co2 sensor");
        Self { tick: 0 }
    }
}

impl Default for SimulatedCo2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Co2Sensor for SimulatedCo2 {
    fn read_ppm(&mut self) -> Result<u16> {
        self.tick = self.tick.wrapping_add(1);
        let phase = self.tick as f32 / 120.0;
        Ok((800.0 + 350.0 * phase.sin()) as u16)
    }
}

/// humidity/temperature around a room-like baseline
pub struct SimulatedClimate {
    tick: u32,
    bias: f32,
}

impl SimulatedClimate {
    pub fn new(bias: f32) -> Self {
        tracing::info!("Using MOCK climate sensor (bias {:+.1})", bias);
        Self { tick: 0, bias }
    }
}

impl ClimateSensor for SimulatedClimate {
    fn measure(&mut self) -> Result<(f32, f32)> {
        self.tick = self.tick.wrapping_add(1);
        let phase = self.tick as f32 / 600.0;
        let humidity = 45.0 + 8.0 * phase.cos() + self.bias;
        let temperature = 22.0 + 2.5 * phase.sin() + self.bias / 2.0;
        Ok((humidity, temperature))
    }
}

/// display that only logs
#[derive(Default)]
pub struct LogDisplay;

impl Display for LogDisplay {
    fn show(&self, sample: &Sample, _thresholds: &Thresholds) {
        tracing::trace!(
            "[MOCK LCD] {} ppm | {:.1}% | {:.1}C",
            sample.co2_ppm, sample.humidity, sample.temperature
        );
    }

    fn set_power(&self, on: bool) {
        tracing::debug!("[MOCK LCD] power {}", if on { "ON" } else { "OFF" });
    }

    fn power_off_pending(&self) -> bool {
        false
    }

    fn power_off_requested(&self) {
        tracing::debug!("[MOCK LCD] power-off requested");
    }
}

/// alarm that only logs
#[derive(Default)]
pub struct LogAlarm;

impl Alarm for LogAlarm {
    fn play(&self, song: AlarmSong) -> Result<()> {
        tracing::info!("[MOCK ALARM] {} ({} beeps)", song.wire_name(), alarm_pattern(song).len());
        Ok(())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

/// piezo buzzer behind an active-low relay
#[cfg(feature = "hardware")]
pub struct GpioBuzzer {
    pin: u8,
}

#[cfg(feature = "hardware")]
impl GpioBuzzer {
    pub fn new(pin: u8) -> Self {
        tracing::info!("Using REAL buzzer on GPIO {} (rppal)", pin);
        Self { pin }
    }
}

#[cfg(feature = "hardware")]
impl Alarm for GpioBuzzer {
    fn play(&self, song: AlarmSong) -> Result<()> {
        use rppal::gpio::Gpio;
        use std::thread::sleep;
        use std::time::Duration;

        // relay idles HIGH (off); LOW sounds the buzzer
        let mut pin = Gpio::new()?.get(self.pin)?.into_output_high();
        for &(on_ms, off_ms) in alarm_pattern(song) {
            pin.set_low();
            sleep(Duration::from_millis(on_ms.into()));
            pin.set_high();
            sleep(Duration::from_millis(off_ms.into()));
        }
        Ok(())
    }
}

// ==============================================================================================
// wiring
// ==============================================================================================

/// every collaborator the monitor needs
pub struct Peripherals {
    pub co2: Box<dyn Co2Sensor>,
    /// redundant climate sensors, averaged by the sampler
    pub climate: Vec<Box<dyn ClimateSensor>>,
    pub display: Arc<dyn Display>,
    pub alarm: Arc<dyn Alarm>,
    pub storage: Arc<dyn StorageProbe>,
}

impl Peripherals {
    /// pick implementations for this build
    pub fn detect(config: &HostConfig) -> Self {
        #[cfg(feature = "hardware")]
        let alarm: Arc<dyn Alarm> = Arc::new(GpioBuzzer::new(config.buzzer.gpio_pin));
        #[cfg(not(feature = "hardware"))]
        let alarm: Arc<dyn Alarm> = Arc::new(LogAlarm);

        Self {
            co2: Box::new(SimulatedCo2::new()),
            climate: vec![
                Box::new(SimulatedClimate::new(0.0)),
                Box::new(SimulatedClimate::new(0.4)),
            ],
            display: Arc::new(LogDisplay),
            alarm,
            storage: Arc::new(DiskUsage::new(&config.storage.dir)),
        }
    }
}
