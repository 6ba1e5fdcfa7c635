//! ==============================================================================
//! domain.rs - sensor samples, chart selections and shared settings
//! ==============================================================================
//!
//! purpose:
//!     the value types that flow between the sampler, the broadcast writer,
//!     the telemetry store and the wire protocol.
//!
//! relationships:
//!     - used by: store.rs (Reading packing), writer.rs, protocol.rs, sampler.rs
//!     - persisted by: settings.rs (GlobalSettings as toml)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};

/// one live sensor triple, as produced every sampler tick
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    /// co2 concentration in ppm
    pub co2_ppm: u16,
    /// relative humidity (0-100%)
    pub humidity: f32,
    /// temperature in celsius
    pub temperature: f32,
}

impl Sample {
    /// value shown on a chart of the given metric
    pub fn value(&self, metric: Metric) -> f32 {
        match metric {
            Metric::Co2 => self.co2_ppm as f32,
            Metric::Humidity => self.humidity,
            Metric::Temperature => self.temperature,
        }
    }
}

// ==============================================================================
// reading - the persisted, quantized sample
// ==============================================================================
// packed layout (one u32):
//     bits 31-19  co2 ppm         (13 bits, max 8191)
//     bits 18-12  humidity %      (7 bits)
//     bits 11-4   temp whole part (8 bits, no sign)
//     bits  3-0   temp tenths

const CO2_MAX: u16 = 0x1FFF;
const HUMIDITY_MAX: u8 = 100;
const TEMP_DECI_MAX: u16 = 255 * 10 + 9;

/// timestamped, quantized reading stored in the ring and the readings log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reading {
    /// unix timestamp in seconds
    pub timestamp: u32,
    pub co2_ppm: u16,
    /// whole percent
    pub humidity: u8,
    /// tenths of a degree celsius (235 = 23.5)
    pub temp_deci: u16,
}

impl Reading {
    /// quantize a live sample the way the log stores it (truncation, not rounding)
    pub fn from_sample(timestamp: u32, sample: &Sample) -> Self {
        Self {
            timestamp,
            co2_ppm: sample.co2_ppm.min(CO2_MAX),
            humidity: (sample.humidity.max(0.0) as u8).min(HUMIDITY_MAX),
            temp_deci: temp_deci(sample.temperature),
        }
    }

    pub fn pack(&self) -> u32 {
        let whole = u32::from(self.temp_deci / 10) & 0xFF;
        let tenths = u32::from(self.temp_deci % 10);
        (u32::from(self.co2_ppm) & 0x1FFF) << 19
            | (u32::from(self.humidity) & 0x7F) << 12
            | whole << 4
            | tenths
    }

    pub fn unpack(timestamp: u32, packed: u32) -> Self {
        let whole = ((packed >> 4) & 0xFF) as u16;
        let tenths = (packed & 0xF) as u16;
        Self {
            timestamp,
            co2_ppm: (packed >> 19) as u16,
            humidity: ((packed >> 12) & 0x7F) as u8,
            temp_deci: whole * 10 + tenths,
        }
    }

    /// chart value of the given metric as it appears in a `data` frame
    pub fn format(&self, metric: Metric) -> String {
        match metric {
            Metric::Co2 => self.co2_ppm.to_string(),
            Metric::Humidity => self.humidity.to_string(),
            Metric::Temperature => format!("{}.{}", self.temp_deci / 10, self.temp_deci % 10),
        }
    }
}

/// truncated tenths of a degree; NaN and infinities from a faulty sensor store as 0
fn temp_deci(temperature: f32) -> u16 {
    if !temperature.is_finite() || temperature <= 0.0 {
        return 0;
    }
    if temperature >= 256.0 {
        return TEMP_DECI_MAX;
    }
    let whole = temperature.trunc() as u16;
    let tenths = ((temperature * 10.0) as u16).saturating_sub(whole * 10);
    whole * 10 + tenths.min(9)
}

// ==============================================================================
// chart selection
// ==============================================================================

/// data series a client is charting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Co2,
    Humidity,
    Temperature,
}

impl Metric {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::Co2),
            1 => Some(Self::Humidity),
            2 => Some(Self::Temperature),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Co2 => "co2_chart",
            Self::Humidity => "humd_chart",
            Self::Temperature => "temp_chart",
        }
    }
}

/// time window of a client's chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    #[default]
    FiveMinutes,
    OneHour,
    OneDay,
}

impl Scale {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::FiveMinutes),
            1 => Some(Self::OneHour),
            2 => Some(Self::OneDay),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
        }
    }

    /// (window, stride) in ring entries; entries are 5 s apart
    pub fn window(self) -> (usize, usize) {
        match self {
            Self::FiveMinutes => (60, 1),
            Self::OneHour => (720, 24),
            Self::OneDay => (17280, 432),
        }
    }

    /// number of x-axis divisions the dashboard draws
    pub fn x_divs(self) -> u32 {
        let (window, stride) = self.window();
        (window / stride) as u32
    }

    /// multiplier from x index to axis label units
    pub fn x_scale(self) -> f32 {
        match self {
            Self::FiveMinutes => 0.083333,
            Self::OneHour => 2.0,
            Self::OneDay => 0.6,
        }
    }

    /// how often a client on this scale gets a `data_upd` point
    pub fn update_period_ms(self) -> u32 {
        match self {
            Self::FiveMinutes => 5_000,
            Self::OneHour => 120_000,
            Self::OneDay => 2_160_000,
        }
    }
}

// ==============================================================================
// global settings
// ==============================================================================

/// alarm played when co2 stays above its warning level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmSong {
    None,
    #[default]
    Beep,
    Sos,
    Co2,
    ImperialMarch,
    StarTrek,
    Doom,
}

impl AlarmSong {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::None),
            1 => Some(Self::Beep),
            2 => Some(Self::Sos),
            3 => Some(Self::Co2),
            4 => Some(Self::ImperialMarch),
            5 => Some(Self::StarTrek),
            6 => Some(Self::Doom),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Beep => "beep",
            Self::Sos => "sos",
            Self::Co2 => "co2",
            Self::ImperialMarch => "imperial_march",
            Self::StarTrek => "star_trek",
            Self::Doom => "doom",
        }
    }
}

/// warning levels; humidity in %, temperature in whole degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub co2: u16,
    pub humidity_low: u8,
    pub humidity_high: u8,
    pub temp_low: i8,
    pub temp_high: i8,
}

impl Default for Thresholds {
    fn default() -> Self {
        // ASHRAE 2006 / EN 13779:2008 co2 guidance
        Self {
            co2: 1000,
            humidity_low: 30,
            humidity_high: 50,
            temp_low: 20,
            temp_high: 27,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// local display on/off times; equal times mean "no schedule"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisplaySchedule {
    pub on: ClockTime,
    pub off: ClockTime,
}

impl DisplaySchedule {
    pub fn is_enabled(&self) -> bool {
        self.on != self.off
    }
}

/// the single shared settings record, mutated only by the broadcast writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub thresholds: Thresholds,
    pub alarm: AlarmSong,
    pub display: DisplaySchedule,
}
