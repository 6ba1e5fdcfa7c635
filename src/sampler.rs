//! ==============================================================================
//! sampler.rs - sensor tick producer
//! ==============================================================================
//!
//! purpose:
//!     once per polling interval: measure, publish a Sample to the dispatch
//!     queue, refresh the local display, run the co2 alarm and apply the
//!     display on/off schedule.
//!
//! sensor policy:
//!     - two climate sensors are averaged (rounded to 0.1); if one fails the
//!       other is used alone; if both fail the previous values are kept.
//!     - the co2 sensor only produces a new value every few seconds, so it is
//!       read every `co2_interval_ms` and the last value is reused between.
//!
//! relationships:
//!     - reads: settings.rs (thresholds, alarm, schedule; read only)
//!     - feeds: queue.rs -> writer.rs
//!     - drives: hal.rs collaborators
//!
//! ==============================================================================

use crate::config::PollingConfig;
use crate::domain::{AlarmSong, ClockTime, DisplaySchedule, Sample};
use crate::hal::{Alarm, ClimateSensor, Co2Sensor, Display};
use crate::queue::{EventSender, UpdateEvent};
use crate::settings::SharedSettings;

use chrono::Timelike;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

/// consecutive ticks above the co2 threshold before the alarm sounds
pub const ALARM_DELAY_TICKS: u32 = 20;

/// why the sampler stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerExit {
    Stopped,
    PowerOff,
}

pub struct Sampler {
    co2: Box<dyn Co2Sensor>,
    climate: Vec<Box<dyn ClimateSensor>>,
    display: Arc<dyn Display>,
    alarm: Arc<dyn Alarm>,
    settings: SharedSettings,
    events: EventSender,
    interval_ms: u64,
    co2_interval_ms: u64,
    since_co2_ms: u64,
    show_data: bool,
    power_off: Option<Arc<Notify>>,
    last: Sample,
    monitor: AlarmMonitor,
    display_on: bool,
}

impl Sampler {
    pub fn new(
        co2: Box<dyn Co2Sensor>,
        climate: Vec<Box<dyn ClimateSensor>>,
        display: Arc<dyn Display>,
        alarm: Arc<dyn Alarm>,
        settings: SharedSettings,
        events: EventSender,
        polling: &PollingConfig,
    ) -> Self {
        Self {
            co2,
            climate,
            display,
            alarm,
            settings,
            events,
            interval_ms: polling.interval_ms.max(1),
            co2_interval_ms: polling.co2_interval_ms,
            since_co2_ms: 0,
            show_data: false,
            power_off: None,
            last: Sample { co2_ppm: 0, humidity: 0.0, temperature: 0.0 },
            monitor: AlarmMonitor::default(),
            display_on: true,
        }
    }

    /// log every sample at info level
    pub fn show_sensor_data(mut self, show: bool) -> Self {
        self.show_data = show;
        self
    }

    /// notified when the display asks for a power-off
    pub fn on_power_off(mut self, notify: Arc<Notify>) -> Self {
        self.power_off = Some(notify);
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SamplerExit {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.read_co2();

        loop {
            if *shutdown.borrow() {
                return SamplerExit::Stopped;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return SamplerExit::Stopped,
            }

            if self.display.power_off_pending() {
                tracing::info!("[SAMPLER] Power-off requested from the display");
                self.display.power_off_requested();
                if let Some(notify) = &self.power_off {
                    notify.notify_one();
                }
                return SamplerExit::PowerOff;
            }

            let sample = self.measure();
            if self.events.push(UpdateEvent::sample(sample)).await.is_err() {
                return SamplerExit::Stopped;
            }
            self.after_publish(sample).await;
        }
    }

    fn measure(&mut self) -> Sample {
        let mut ok = Vec::with_capacity(self.climate.len());
        for (i, sensor) in self.climate.iter_mut().enumerate() {
            match sensor.measure() {
                Ok(reading) => ok.push(reading),
                Err(e) => tracing::debug!("[SAMPLER] Climate sensor {} read error: {}", i, e),
            }
        }
        let (humidity, temperature) = combine_climate(&ok, (self.last.humidity, self.last.temperature));
        self.last.humidity = humidity;
        self.last.temperature = temperature;

        if self.since_co2_ms >= self.co2_interval_ms {
            self.read_co2();
            self.since_co2_ms = 0;
        }
        self.since_co2_ms += self.interval_ms;
        self.last
    }

    fn read_co2(&mut self) {
        match self.co2.read_ppm() {
            Ok(ppm) => self.last.co2_ppm = ppm,
            Err(e) => tracing::debug!("[SAMPLER] CO2 read error: {}", e),
        }
    }

    async fn after_publish(&mut self, sample: Sample) {
        let settings = *self.settings.read().await;

        if self.show_data {
            tracing::info!(
                "[SENSORS] CO2: {} ppm | Humidity: {:.1}% | Temp: {:.1}°C",
                sample.co2_ppm, sample.humidity, sample.temperature
            );
        }
        if self.display_on {
            self.display.show(&sample, &settings.thresholds);
        }

        if let Some(song) = self.monitor.observe(sample.co2_ppm, settings.thresholds.co2, settings.alarm) {
            tracing::info!("[SAMPLER] CO2 above {} ppm - sounding {}", settings.thresholds.co2, song.wire_name());
            let alarm = Arc::clone(&self.alarm);
            tokio::task::spawn_blocking(move || {
                if let Err(e) = alarm.play(song) {
                    tracing::warn!("[SAMPLER] Alarm failed: {}", e);
                }
            });
        }

        let now = chrono::Local::now();
        let clock = ClockTime::new(now.hour() as u8, now.minute() as u8);
        if let Some(on) = clock.and_then(|c| schedule_action(&settings.display, self.display_on, c)) {
            self.display.set_power(on);
            self.display_on = on;
        }
    }
}

/// merge climate readings: mean rounded to 0.1, a lone reading as is,
/// `last` when nothing was read
pub fn combine_climate(readings: &[(f32, f32)], last: (f32, f32)) -> (f32, f32) {
    match readings {
        [] => last,
        [single] => *single,
        many => {
            let n = many.len() as f32;
            let (h, t) = many.iter().fold((0.0, 0.0), |(h, t), (rh, rt)| (h + rh, t + rt));
            (round_tenth(h / n), round_tenth(t / n))
        }
    }
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// display power change due at `now`, if any
pub fn schedule_action(schedule: &DisplaySchedule, display_on: bool, now: ClockTime) -> Option<bool> {
    if !schedule.is_enabled() {
        return None;
    }
    if !display_on && now == schedule.on {
        Some(true)
    } else if display_on && now == schedule.off {
        Some(false)
    } else {
        None
    }
}

/// one alarm per high-co2 episode, after ALARM_DELAY_TICKS ticks above the threshold
#[derive(Debug)]
pub struct AlarmMonitor {
    remaining: u32,
    warned: bool,
}

impl Default for AlarmMonitor {
    fn default() -> Self {
        Self { remaining: ALARM_DELAY_TICKS, warned: false }
    }
}

impl AlarmMonitor {
    /// returns the song to play on this tick, if any
    pub fn observe(&mut self, ppm: u16, threshold: u16, song: AlarmSong) -> Option<AlarmSong> {
        if ppm > threshold {
            self.remaining = self.remaining.saturating_sub(1);
        } else {
            self.remaining = ALARM_DELAY_TICKS;
            self.warned = false;
        }

        if song != AlarmSong::None && !self.warned && self.remaining == 0 {
            self.warned = true;
            return Some(song);
        }
        None
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GlobalSettings, Thresholds};
    use crate::queue::{dispatch_queue, Op};
    use crate::settings;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

    #[test]
    fn test_combine_climate() {
        assert_eq!(combine_climate(&[], (40.0, 21.0)), (40.0, 21.0));
        assert_eq!(combine_climate(&[(55.55, 19.12)], (40.0, 21.0)), (55.55, 19.12));
        let (h, t) = combine_climate(&[(40.0, 21.0), (41.3, 22.46)], (0.0, 0.0));
        assert!((h - 40.7).abs() < 1e-4, "{}", h);
        assert!((t - 21.7).abs() < 1e-4, "{}", t);
    }

    #[test]
    fn test_alarm_after_twenty_high_ticks() {
        let mut monitor = AlarmMonitor::default();
        for _ in 0..ALARM_DELAY_TICKS - 1 {
            assert_eq!(monitor.observe(1500, 1000, AlarmSong::Sos), None);
        }
        assert_eq!(monitor.observe(1500, 1000, AlarmSong::Sos), Some(AlarmSong::Sos));
        // once per episode
        for _ in 0..100 {
            assert_eq!(monitor.observe(1500, 1000, AlarmSong::Sos), None);
        }
        // re-armed once co2 is back at the threshold
        assert_eq!(monitor.observe(1000, 1000, AlarmSong::Sos), None);
        for _ in 0..ALARM_DELAY_TICKS - 1 {
            assert_eq!(monitor.observe(1001, 1000, AlarmSong::Beep), None);
        }
        assert_eq!(monitor.observe(1001, 1000, AlarmSong::Beep), Some(AlarmSong::Beep));
    }

    #[test]
    fn test_alarm_interrupted_episode_restarts_count() {
        let mut monitor = AlarmMonitor::default();
        for _ in 0..ALARM_DELAY_TICKS - 1 {
            monitor.observe(1500, 1000, AlarmSong::Co2);
        }
        assert_eq!(monitor.observe(900, 1000, AlarmSong::Co2), None);
        assert_eq!(monitor.observe(1500, 1000, AlarmSong::Co2), None);
    }

    #[test]
    fn test_silent_alarm_never_plays() {
        let mut monitor = AlarmMonitor::default();
        for _ in 0..3 * ALARM_DELAY_TICKS {
            assert_eq!(monitor.observe(5000, 1000, AlarmSong::None), None);
        }
        // picking a song mid-episode plays it on the next tick
        assert_eq!(monitor.observe(5000, 1000, AlarmSong::Doom), Some(AlarmSong::Doom));
    }

    #[test]
    fn test_schedule_action() {
        let at = |h, m| ClockTime::new(h, m).unwrap();
        let schedule = DisplaySchedule { on: at(7, 0), off: at(22, 30) };
        assert_eq!(schedule_action(&schedule, false, at(7, 0)), Some(true));
        assert_eq!(schedule_action(&schedule, true, at(7, 0)), None);
        assert_eq!(schedule_action(&schedule, true, at(22, 30)), Some(false));
        assert_eq!(schedule_action(&schedule, false, at(22, 30)), None);
        assert_eq!(schedule_action(&schedule, true, at(12, 0)), None);

        let disabled = DisplaySchedule { on: at(8, 0), off: at(8, 0) };
        assert_eq!(schedule_action(&disabled, true, at(8, 0)), None);
    }

    struct CountingCo2(Arc<AtomicU16>);

    impl Co2Sensor for CountingCo2 {
        fn read_ppm(&mut self) -> Result<u16> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) + 500)
        }
    }

    struct FixedClimate(Option<(f32, f32)>);

    impl ClimateSensor for FixedClimate {
        fn measure(&mut self) -> Result<(f32, f32)> {
            self.0.ok_or_else(|| anyhow!("no response"))
        }
    }

    #[derive(Default)]
    struct TestDisplay {
        shown: AtomicUsize,
        wants_off: AtomicBool,
        told_off: AtomicBool,
    }

    impl Display for TestDisplay {
        fn show(&self, _sample: &Sample, _thresholds: &Thresholds) {
            self.shown.fetch_add(1, Ordering::SeqCst);
        }
        fn set_power(&self, _on: bool) {}
        fn power_off_pending(&self) -> bool {
            self.wants_off.load(Ordering::SeqCst)
        }
        fn power_off_requested(&self) {
            self.told_off.store(true, Ordering::SeqCst);
        }
    }

    fn sampler(
        display: Arc<TestDisplay>,
        co2_reads: Arc<AtomicU16>,
        events: EventSender,
    ) -> Sampler {
        Sampler::new(
            Box::new(CountingCo2(co2_reads)),
            vec![Box::new(FixedClimate(Some((40.0, 20.0)))), Box::new(FixedClimate(None))],
            display,
            Arc::new(crate::hal::LogAlarm),
            settings::shared(GlobalSettings::default()),
            events,
            &PollingConfig { interval_ms: 5, co2_interval_ms: 25 },
        )
    }

    #[tokio::test]
    async fn test_run_publishes_ticks() {
        let (tx, mut rx) = dispatch_queue();
        let display = Arc::new(TestDisplay::default());
        let reads = Arc::new(AtomicU16::new(0));
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(sampler(Arc::clone(&display), Arc::clone(&reads), tx).run(shutdown));

        let mut ppms = Vec::new();
        for _ in 0..11 {
            let event = rx.pop().await.unwrap();
            let Op::Sample(sample) = event.op else { panic!("expected a sample") };
            assert_eq!((sample.humidity, sample.temperature), (40.0, 20.0));
            ppms.push(sample.co2_ppm);
        }
        // initial read, then a fresh value every fifth tick
        assert_eq!(ppms, [500, 500, 500, 500, 500, 501, 501, 501, 501, 501, 502]);

        stop.send(true).unwrap();
        assert_eq!(task.await.unwrap(), SamplerExit::Stopped);
        assert!(display.shown.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test]
    async fn test_display_power_off_request() {
        let (tx, _rx) = dispatch_queue();
        let display = Arc::new(TestDisplay::default());
        display.wants_off.store(true, Ordering::SeqCst);
        let notify = Arc::new(Notify::new());
        let (_stop, shutdown) = watch::channel(false);

        let exit = sampler(Arc::clone(&display), Arc::new(AtomicU16::new(0)), tx)
            .on_power_off(Arc::clone(&notify))
            .run(shutdown)
            .await;
        assert_eq!(exit, SamplerExit::PowerOff);
        assert!(display.told_off.load(Ordering::SeqCst));
        // the permit is stored for a later waiter
        tokio::time::timeout(Duration::from_millis(100), notify.notified()).await.unwrap();
    }
}
