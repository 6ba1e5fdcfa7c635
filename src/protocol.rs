//! ==============================================================================
//! protocol.rs - browser-facing wire protocol
//! ==============================================================================
//!
//! purpose:
//!     inbound: turns HTTP-style request lines into commands.
//!     outbound: formats server-sent event frames and the few fixed
//!     HTTP responses the dashboard relies on.
//!
//! wire contract:
//!     every push frame is `event: <name>\ndata: <fields>\n\n` and the field
//!     order of each event is fixed by the existing dashboard front end.
//!     nothing else about HTTP is implemented; header lines are ignored.
//!
//! ==============================================================================

use crate::domain::{AlarmSong, ClockTime, DisplaySchedule, Metric, Sample, Scale, Thresholds};
use crate::error::ProtocolError;
use crate::hal::StorageUsage;

// ==============================================================================
// inbound commands
// ==============================================================================

/// a parsed client request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `/` - the dashboard page
    Page,
    /// `/upd?id=<n>` - open the event stream under correlation id n
    Subscribe { id: u32 },
    /// `?cw=&hwl=&hwh=&twl=&twh=`
    ChangeWarnings(Thresholds),
    /// `?cs=<song>`
    ChangeSound(AlarmSong),
    /// `?sw=<metric>&id=<n>`
    SwitchMetric { metric: Metric, id: u32 },
    /// `?sc=<scale>&id=<n>`
    ChangeScale { scale: Scale, id: u32 },
    /// `?lo=HH:MM&..=HH:MM`
    SetDisplaySchedule(DisplaySchedule),
    /// `/download`
    Export,
    /// `/delete`
    Purge,
}

/// parse one inbound line
///
/// returns None for lines that are not request lines (headers, blanks),
/// Some(Err) for request lines that cannot be served.
pub fn parse_line(line: &str) -> Option<Result<Command, ProtocolError>> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if !method.bytes().all(|b| b.is_ascii_uppercase()) || !target.starts_with('/') {
        return None;
    }
    Some(parse_target(target))
}

fn parse_target(target: &str) -> Result<Command, ProtocolError> {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    if path.starts_with("/upd") {
        let params = Params::parse(query.unwrap_or(""));
        return Ok(Command::Subscribe { id: params.number("id")? });
    }

    match (path, query) {
        ("/", None) => Ok(Command::Page),
        ("/download", None) => Ok(Command::Export),
        ("/delete", None) => Ok(Command::Purge),
        (_, Some(query)) => parse_settings(Params::parse(query)),
        _ => Err(ProtocolError::UnknownRoute(target.to_string())),
    }
}

fn parse_settings(params: Params<'_>) -> Result<Command, ProtocolError> {
    if params.has("cw") {
        return Ok(Command::ChangeWarnings(Thresholds {
            co2: params.number("cw")?,
            humidity_low: params.bounded("hwl", 100)?,
            humidity_high: params.bounded("hwh", 100)?,
            temp_low: params.number("twl")?,
            temp_high: params.number("twh")?,
        }));
    }
    if params.has("cs") {
        let index = params.number("cs")?;
        let song = AlarmSong::from_index(index).ok_or_else(|| params.invalid("cs"))?;
        return Ok(Command::ChangeSound(song));
    }
    if params.has("sw") {
        let metric = Metric::from_index(params.number("sw")?).ok_or_else(|| params.invalid("sw"))?;
        return Ok(Command::SwitchMetric { metric, id: params.number("id")? });
    }
    if params.has("sc") {
        let scale = Scale::from_index(params.number("sc")?).ok_or_else(|| params.invalid("sc"))?;
        return Ok(Command::ChangeScale { scale, id: params.number("id")? });
    }
    if params.has("lo") {
        // the off time is the first other pair, whatever its key
        let off = params
            .pairs
            .iter()
            .find(|(k, _)| *k != "lo")
            .map(|(_, v)| *v)
            .ok_or(ProtocolError::MissingParameter("off time"))?;
        let on = params.get("lo").unwrap_or_default();
        return Ok(Command::SetDisplaySchedule(DisplaySchedule {
            on: parse_clock(on).ok_or_else(|| params.invalid("lo"))?,
            off: parse_clock(off).ok_or(ProtocolError::InvalidParameter {
                name: "off time",
                value: off.to_string(),
            })?,
        }));
    }
    Err(ProtocolError::UnknownRoute(format!("?{}", params.raw)))
}

fn parse_clock(value: &str) -> Option<ClockTime> {
    let value = value.replace("%3A", ":").replace("%3a", ":");
    let (hour, minute) = value.split_once(':')?;
    ClockTime::new(hour.trim().parse().ok()?, minute.trim().parse().ok()?)
}

/// query string as ordered key/value pairs
struct Params<'a> {
    raw: &'a str,
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Params<'a> {
    fn parse(raw: &'a str) -> Self {
        let pairs = raw
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| p.split_once('=').unwrap_or((p, "")))
            .collect();
        Self { raw, pairs }
    }

    fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| *k == key)
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn invalid(&self, name: &'static str) -> ProtocolError {
        ProtocolError::InvalidParameter {
            name,
            value: self.get(name).unwrap_or_default().to_string(),
        }
    }

    fn number<T: std::str::FromStr>(&self, name: &'static str) -> Result<T, ProtocolError> {
        let value = self.get(name).ok_or(ProtocolError::MissingParameter(name))?;
        value.trim().parse().map_err(|_| self.invalid(name))
    }

    fn bounded(&self, name: &'static str, max: u8) -> Result<u8, ProtocolError> {
        let value: u8 = self.number(name)?;
        if value > max {
            return Err(self.invalid(name));
        }
        Ok(value)
    }
}

// ==============================================================================
// fixed responses
// ==============================================================================

/// event-stream response head sent once per subscription
pub const STREAM_HEAD: &str = "HTTP/1.1 200 OK\n\
Connection: keep-alive\n\
Content-Type: text/event-stream\n\
Cache-Control: no-store\n\
Keep-Alive: timeout=60, max=60\n\n";

/// bare acknowledgment
pub const OK_RESPONSE: &str = "HTTP/1.1 200 OK\n\
Content-Length: 0\n\n";

const NOT_FOUND_BODY: &str = "<body style=\"background-color:#2b2b2b;color:#b2b2b2;font-family:'GT Pressura Mono'\">\
<h1>This isn't the Page you're looking for...</h1>\
<h2>Move along... Move along</h2></body>";

/// generic error response for malformed requests
pub fn not_found_response() -> String {
    format!(
        "HTTP/1.1 404 Not Found\nConnection: close\nContent-Type: text/html\nContent-Length: {}\n\n{}",
        NOT_FOUND_BODY.len(),
        NOT_FOUND_BODY
    )
}

pub fn page_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\nConnection: keep-alive\nCache-Control: no-store\nContent-Type: text/html\n\
Content-Length: {}\nKeep-Alive: timeout=60, max=160\n\n{}",
        body.len(),
        body
    )
}

pub fn download_head(filename: &str, len: u64) -> String {
    format!(
        "HTTP/1.1 200 OK\nContent-Type: application/octet-stream\n\
Content-Disposition: attachment; filename=\"{}\"\nContent-Length: {}\n\n",
        filename, len
    )
}

// ==============================================================================
// event frames
// ==============================================================================

pub fn event_frame(name: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", name, data)
}

/// float with at most 6 significant digits and no trailing zeros
pub fn compact(value: f32) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (5 - magnitude).clamp(0, 9) as usize;
    let text = format!("{:.*}", decimals, value);
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

pub fn warnings_frame(t: &Thresholds) -> String {
    let data = format!(
        "{},{},{},{},{}",
        t.co2, t.humidity_low, t.humidity_high, t.temp_low, t.temp_high
    );
    event_frame("warnings", &data)
}

pub fn sound_frame(song: AlarmSong) -> String {
    event_frame("sound", song.wire_name())
}

pub fn lcd_times_frame(schedule: &DisplaySchedule) -> String {
    event_frame("lcd_times", &format!("{},{}", schedule.on, schedule.off))
}

pub fn chart_switch_frame(metric: Metric) -> String {
    event_frame("chart_switch", metric.wire_name())
}

pub fn chart_scale_frame(scale: Scale) -> String {
    event_frame("chart_scale", scale.wire_name())
}

pub fn chart_vars_frame(scale: Scale) -> String {
    event_frame("chart_vars", &format!("{},{}", scale.x_divs(), compact(scale.x_scale())))
}

pub fn data_frame(series: &[String]) -> String {
    event_frame("data", &series.join(","))
}

pub fn data_upd_frame(value: f32) -> String {
    event_frame("data_upd", &compact(value))
}

pub fn readings_frame(sample: &Sample) -> String {
    event_frame(
        "readings",
        &format!("{},{:.1},{:.1}", sample.co2_ppm, sample.humidity, sample.temperature),
    )
}

pub fn storage_frame(usage: &StorageUsage) -> String {
    event_frame("storage", &format!("{},{:.1}", compact(usage.fill()), usage.free_gb))
}
