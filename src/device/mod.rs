//! Device minder: the ingestion state machine that normalizes a hardware
//! backend (ALSA MMAP capture or an rtl_tcp byte stream) into a uniform
//! timestamped, decimated (and optionally FM-demodulated) sample stream,
//! then fans that stream out to plugin runners and raw listeners.

#[cfg(feature = "alsa-backend")]
pub mod alsa_backend;
pub mod rtltcp_backend;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::f32::consts::PI;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use mio::Interest;
use serde_json::json;

use crate::error::{EngineError, Result};
use crate::plugin::PluginRunner;
use crate::registry::{OutputSink, PollContext, PollEvent, Pollable};

/// Device refuses to start for longer than this without reporting itself
/// stalled (see `MAX_DEV_QUIET_TIME` in the source).
pub const MAX_DEV_QUIET_TIME: f64 = 30.0;

/// Peak FM deviation assumed for broadcast FM, used to scale the phase
/// discriminator's output to full-scale int16.
const FM_PEAK_DEVIATION_HZ: f32 = 75_000.0;

/// Outcome of one `handle_events` drain from the backend.
pub enum FrameBatch {
    /// `avail` interleaved frames were copied into `buf` (numChan-wide,
    /// i16), with `timestamp` the capture time of the first of them.
    Data { avail: usize, timestamp: f64 },
    /// No new data this cycle; not an error.
    Empty,
}

/// Capability set a hardware ingestion backend must provide. Kept narrow
/// and orchestration-free: all decimation, FM demod, and fan-out logic
/// lives once in `DeviceMinder`, parameterized over this trait, rather
/// than duplicated down a backend inheritance tree.
pub trait Backend {
    fn poll_fds(&self) -> Vec<(RawFd, Interest)>;
    fn is_open(&self) -> bool;
    fn hw_rate(&self) -> u32;
    fn channels(&self) -> u8;
    fn max_sample_abs(&self) -> i32;

    fn do_start(&mut self) -> std::io::Result<()>;
    fn do_stop(&mut self);
    fn do_restart(&mut self) -> std::io::Result<()>;

    /// Called once per dispatch with this cycle's readiness; returns how
    /// many frames (if any) are available without yet copying them.
    fn handle_events(&mut self, events: &[PollEvent]) -> std::io::Result<i64>;

    /// Copy up to `max_frames` interleaved i16 frames into `buf` (which the
    /// caller has sized to `max_frames * channels()`), returning the
    /// number of frames actually copied and the capture timestamp of the
    /// first one.
    fn get_frames(&mut self, max_frames: usize, buf: &mut [i16]) -> std::io::Result<(usize, f64)>;
}

struct RawListenerBinding {
    weak: Weak<RefCell<dyn Pollable>>,
}

pub struct DeviceMinder {
    label: String,
    device_name: String,
    rate: u32,
    backend: Box<dyn Backend>,

    total_frames: u64,
    start_timestamp: f64,
    stop_timestamp: f64,
    last_data_received: f64,
    should_be_running: bool,
    stopped: bool,
    has_error: Option<String>,

    demod_fm_for_raw: bool,
    demod_fm_last_theta: f32,

    decimation_factor: u32,
    downsample_count: [i32; 2],
    downsample_accum: [i32; 2],
    downsample_use_avg: bool,

    plugins: HashMap<String, Weak<RefCell<dyn Pollable>>>,
    raw_listeners: HashMap<String, RawListenerBinding>,

    scratch: Vec<i16>,
}

impl DeviceMinder {
    pub fn new(label: String, device_name: String, rate: u32, backend: Box<dyn Backend>, now: f64) -> Self {
        let decimation_factor = (backend.hw_rate() / rate).max(1);
        DeviceMinder {
            label,
            device_name,
            rate,
            backend,
            total_frames: 0,
            start_timestamp: -1.0,
            stop_timestamp: now,
            last_data_received: -1.0,
            should_be_running: false,
            stopped: true,
            has_error: None,
            demod_fm_for_raw: false,
            demod_fm_last_theta: 0.0,
            decimation_factor,
            downsample_count: [decimation_factor as i32; 2],
            downsample_accum: [0; 2],
            downsample_use_avg: true,
            plugins: HashMap::new(),
            raw_listeners: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    pub fn hw_rate(&self) -> u32 {
        self.backend.hw_rate()
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn channels(&self) -> u8 {
        self.backend.channels()
    }

    pub fn max_sample_abs(&self) -> i32 {
        self.backend.max_sample_abs()
    }

    pub fn decimation_factor(&self) -> u32 {
        self.decimation_factor
    }

    pub fn add_plugin_runner(&mut self, label: String, runner: Weak<RefCell<dyn Pollable>>) {
        self.plugins.insert(label, runner);
    }

    pub fn remove_plugin_runner(&mut self, label: &str) {
        self.plugins.remove(label);
    }

    /// Bind a weak reference to an existing Pollable as a raw-sample
    /// listener. If this is the first listener, the shared decimation
    /// state is reset using `decimation_factor` -- matching the source,
    /// where a single downsample pipeline feeds every raw subscriber and
    /// every plugin runner alike.
    pub fn add_raw_listener(
        &mut self,
        label: String,
        target: &Rc<RefCell<dyn Pollable>>,
        decimation_factor: u32,
        write_wav_header: bool,
        use_avg: bool,
    ) {
        let first = self.raw_listeners.is_empty();
        self.raw_listeners.insert(
            label,
            RawListenerBinding {
                weak: Rc::downgrade(target),
            },
        );
        if first {
            self.decimation_factor = decimation_factor.max(1);
            self.downsample_use_avg = use_avg;
            self.downsample_accum = [0; 2];
            self.downsample_count = [self.decimation_factor as i32; 2];
        }
        if write_wav_header {
            let hdr = crate::wav::WavHeader::new(
                self.backend.hw_rate() / self.decimation_factor.max(1),
                self.backend.channels(),
                0x7fff_fffe / 2,
            );
            let bytes = hdr.to_bytes();
            let mut p = target.borrow_mut();
            if let Some(sink) = p.as_output_sink_mut() {
                let _ = sink.queue_output(&bytes, 0.0);
            }
        }
    }

    pub fn remove_raw_listener(&mut self, label: &str) {
        self.raw_listeners.remove(label);
    }

    pub fn remove_all_raw_listeners(&mut self) {
        self.raw_listeners.clear();
    }

    pub fn set_fm_demod(&mut self, on: bool) {
        self.demod_fm_for_raw = on;
    }

    pub fn start(&mut self, now: f64) -> Result<()> {
        self.should_be_running = true;
        self.do_start(now)
    }

    pub fn stop(&mut self, now: f64) {
        self.should_be_running = false;
        self.do_stop(now);
    }

    fn do_start(&mut self, now: f64) -> Result<()> {
        if !self.backend.is_open() {
            self.backend
                .do_restart()
                .map_err(|e| EngineError::DeviceOpen(e.to_string()))?;
            let hw_rate = self.backend.hw_rate();
            if hw_rate % self.rate != 0 {
                self.backend.do_stop();
                return Err(EngineError::RateNotDivisible {
                    hw_rate,
                    rate: self.rate,
                });
            }
            self.decimation_factor = (hw_rate / self.rate).max(1);
        }
        self.backend
            .do_start()
            .map_err(|e| EngineError::DeviceOpen(e.to_string()))?;
        self.stopped = false;
        self.has_error = None;
        self.last_data_received = now;
        self.start_timestamp = now;
        Ok(())
    }

    fn do_stop(&mut self, now: f64) {
        self.backend.do_stop();
        self.stop_timestamp = now;
        self.stopped = true;
    }

    /// Integer decimation with dithering, in place over `buf` for one
    /// channel's worth of samples spaced `stride` apart starting at
    /// `offset`. Returns the number of output samples produced.
    fn decimate_channel(&mut self, ch: usize, buf: &mut [i16], offset: usize, stride: usize, count: usize) -> usize {
        let factor = self.decimation_factor as i32;
        if factor <= 1 {
            return count;
        }
        let mut out = 0usize;
        let mut src = offset;
        for _ in 0..count {
            if self.downsample_use_avg {
                self.downsample_accum[ch] += buf[src] as i32;
            }
            self.downsample_count[ch] -= 1;
            if self.downsample_count[ch] == 0 {
                self.downsample_count[ch] = factor;
                let sample = if self.downsample_use_avg {
                    let s = (self.downsample_accum[ch] + factor / 2) / factor;
                    self.downsample_accum[ch] -= s * factor;
                    s as i16
                } else {
                    buf[src]
                };
                buf[offset + out * stride] = sample;
                out += 1;
            }
            src += stride;
        }
        out
    }

    /// FM-demodulate a decimated, interleaved stereo buffer of `count`
    /// frames in place, collapsing it to `count` mono samples starting at
    /// index 0 of `buf`.
    fn fm_demod(&mut self, buf: &mut [i16], count: usize) {
        let scale = self.backend.hw_rate() as f32 / (2.0 * PI) / FM_PEAK_DEVIATION_HZ * 32767.0;
        for i in 0..count {
            let i_samp = buf[2 * i] as f32;
            let q_samp = buf[2 * i + 1] as f32;
            let theta = i_samp.atan2(q_samp);
            let mut dtheta = theta - self.demod_fm_last_theta;
            self.demod_fm_last_theta = theta;
            if dtheta > PI {
                dtheta -= 2.0 * PI;
            } else if dtheta < -PI {
                dtheta += 2.0 * PI;
            }
            buf[i] = (scale * dtheta).round() as i16;
        }
    }

    fn effective_channels(&self) -> u8 {
        if self.demod_fm_for_raw && self.backend.channels() == 2 {
            1
        } else {
            self.backend.channels()
        }
    }

    fn fan_out(&mut self, decimated: &[i16], count: usize, timestamp: f64, ctx: &mut PollContext) {
        let nchan = self.backend.channels() as usize;

        if !self.raw_listeners.is_empty() {
            let mut listener_buf: Vec<i16> = decimated[..count * nchan].to_vec();
            if self.demod_fm_for_raw && nchan == 2 {
                self.fm_demod(&mut listener_buf, count);
            }
            let eff_chan = self.effective_channels() as usize;
            let samples = &listener_buf[..count * eff_chan];
            let mut bytes = Vec::with_capacity(samples.len() * 2);
            for s in samples {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
            let bytes = bytes.as_slice();

            self.raw_listeners.retain(|_, binding| {
                match binding.weak.upgrade() {
                    Some(p) => {
                        let mut p = p.borrow_mut();
                        if let Some(sink) = p.as_output_sink_mut() {
                            let _ = sink.queue_output(bytes, timestamp);
                        }
                        true
                    }
                    None => false,
                }
            });
        }

        if !self.plugins.is_empty() {
            let ch0: Vec<i16> = (0..count).map(|i| decimated[i * nchan]).collect();
            let ch1: Option<Vec<i16>> = if nchan == 2 {
                Some((0..count).map(|i| decimated[i * nchan + 1]).collect())
            } else {
                None
            };
            self.plugins.retain(|_, weak| match weak.upgrade() {
                Some(p) => {
                    if let Some(runner) = p.borrow_mut().as_any_mut().downcast_mut::<PluginRunner>() {
                        runner.handle_data(count, &ch0, ch1.as_deref(), timestamp, self.rate);
                    }
                    true
                }
                None => false,
            });
        }

        let _ = ctx;
    }

    pub fn describe_json(&self) -> serde_json::Value {
        json!({
            "type": "DevMinder",
            "device": self.device_name,
            "rate": self.rate,
            "hwRate": self.backend.hw_rate(),
            "numChan": self.backend.channels(),
            "startTimestamp": self.start_timestamp,
            "stopTimestamp": self.stop_timestamp,
            "running": !self.stopped,
            "hasError": self.has_error,
            "totalFrames": self.total_frames,
        })
    }
}

impl Pollable for DeviceMinder {
    fn poll_fds(&self) -> Vec<(RawFd, Interest)> {
        if self.should_be_running && self.backend.is_open() {
            self.backend.poll_fds()
        } else {
            Vec::new()
        }
    }

    fn handle_events(&mut self, events: &[PollEvent], timed_out: bool, now: f64, ctx: &mut PollContext) {
        if !self.backend.is_open() {
            return;
        }
        if timed_out {
            if self.should_be_running && self.last_data_received >= 0.0 && now - self.last_data_received > MAX_DEV_QUIET_TIME {
                ctx.emit_async(json!({
                    "event": "devStalled",
                    "devLabel": self.label,
                    "error": format!("no data received for {:.1} secs", now - self.last_data_received),
                }));
                self.last_data_received = now;
                self.stop(now);
                let _ = ctx.resync(&self.label);
            }
            return;
        }

        match self.backend.handle_events(events) {
            Err(e) => {
                ctx.emit_async(json!({
                    "event": "devProblem",
                    "devLabel": self.label,
                    "error": e.to_string(),
                }));
                let _ = self.backend.do_restart();
                self.start_timestamp = now;
            }
            Ok(avail) if avail > 0 => {
                self.last_data_received = now;
                let avail = avail as usize;
                let nchan = self.backend.channels() as usize;
                self.scratch.resize(avail * nchan, 0);
                match self.backend.get_frames(avail, &mut self.scratch) {
                    Ok((got, timestamp)) => {
                        self.total_frames += got as u64;
                        let mut decimated_count = got;
                        if self.decimation_factor > 1 {
                            let mut out_counts = [0usize; 2];
                            for ch in 0..nchan {
                                out_counts[ch] = self.decimate_channel(ch, &mut self.scratch, ch, nchan, got);
                            }
                            decimated_count = out_counts[0];
                        }
                        if decimated_count > 0 {
                            let decimated = self.scratch.clone();
                            self.fan_out(&decimated, decimated_count, timestamp, ctx);
                        }
                    }
                    Err(_) => {
                        ctx.emit_async(json!({
                            "event": "devProblem",
                            "devLabel": self.label,
                            "error": "failed to read frames from backend",
                        }));
                    }
                }
            }
            Ok(_) => {
                if self.should_be_running && self.last_data_received >= 0.0 && now - self.last_data_received > MAX_DEV_QUIET_TIME {
                    ctx.emit_async(json!({
                        "event": "devStalled",
                        "devLabel": self.label,
                        "error": format!("no data received for {:.1} secs", now - self.last_data_received),
                    }));
                    self.last_data_received = now;
                    self.stop(now);
                    let _ = ctx.resync(&self.label);
                }
            }
        }
    }

    fn describe(&self) -> serde_json::Value {
        self.describe_json()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend {
        hw_rate: u32,
        channels: u8,
    }

    impl Backend for FakeBackend {
        fn poll_fds(&self) -> Vec<(RawFd, Interest)> {
            vec![]
        }
        fn is_open(&self) -> bool {
            true
        }
        fn hw_rate(&self) -> u32 {
            self.hw_rate
        }
        fn channels(&self) -> u8 {
            self.channels
        }
        fn max_sample_abs(&self) -> i32 {
            32767
        }
        fn do_start(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn do_stop(&mut self) {}
        fn do_restart(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn handle_events(&mut self, _e: &[PollEvent]) -> std::io::Result<i64> {
            Ok(0)
        }
        fn get_frames(&mut self, _m: usize, _b: &mut [i16]) -> std::io::Result<(usize, f64)> {
            Ok((0, 0.0))
        }
    }

    #[test]
    fn decimation_factor_from_rates() {
        let backend = Box::new(FakeBackend {
            hw_rate: 192_000,
            channels: 2,
        });
        let dm = DeviceMinder::new("D".into(), "hw:0".into(), 48_000, backend, 0.0);
        assert_eq!(dm.decimation_factor(), 4);
    }

    #[test]
    fn decimate_channel_subsample_matches_identity_formula() {
        let backend = Box::new(FakeBackend {
            hw_rate: 4,
            channels: 1,
        });
        let mut dm = DeviceMinder::new("D".into(), "hw:0".into(), 1, backend, 0.0);
        dm.downsample_use_avg = false;
        dm.decimation_factor = 4;
        dm.downsample_count = [4, 4];
        let mut buf: Vec<i16> = (0..16).map(|i| (i % 65536) as i16).collect();
        let n = dm.decimate_channel(0, &mut buf, 0, 1, 16);
        assert_eq!(n, 4);
        // y_j = x_{4j+3}
        assert_eq!(buf[0], 3);
        assert_eq!(buf[1], 7);
        assert_eq!(buf[2], 11);
        assert_eq!(buf[3], 15);
    }

    #[test]
    fn decimation_accumulator_is_bounded() {
        let backend = Box::new(FakeBackend {
            hw_rate: 8,
            channels: 1,
        });
        let mut dm = DeviceMinder::new("D".into(), "hw:0".into(), 1, backend, 0.0);
        dm.decimation_factor = 8;
        dm.downsample_count = [8, 8];
        let mut buf: Vec<i16> = vec![32767; 64];
        for chunk in buf.chunks_mut(8) {
            dm.decimate_channel(0, chunk, 0, 1, 8);
            assert!(dm.downsample_accum[0].unsigned_abs() <= (8 * 32768) as u32);
        }
    }

    #[test]
    fn fm_demod_matches_formula_for_zero_rotation() {
        let backend = Box::new(FakeBackend {
            hw_rate: 192_000,
            channels: 2,
        });
        let mut dm = DeviceMinder::new("D".into(), "hw:0".into(), 48_000, backend, 0.0);
        // theta_0 = atan2(0, 1) = 0; with last_theta initialized to 0, dtheta = 0.
        let mut buf = vec![0i16, 32767];
        dm.fm_demod(&mut buf, 1);
        assert_eq!(buf[0], 0);
    }

    struct NonDivisibleBackend {
        opened: bool,
    }

    impl Backend for NonDivisibleBackend {
        fn poll_fds(&self) -> Vec<(RawFd, Interest)> {
            vec![]
        }
        fn is_open(&self) -> bool {
            self.opened
        }
        fn hw_rate(&self) -> u32 {
            if self.opened {
                44_100
            } else {
                0
            }
        }
        fn channels(&self) -> u8 {
            2
        }
        fn max_sample_abs(&self) -> i32 {
            32767
        }
        fn do_start(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn do_stop(&mut self) {
            self.opened = false;
        }
        fn do_restart(&mut self) -> std::io::Result<()> {
            self.opened = true;
            Ok(())
        }
        fn handle_events(&mut self, _e: &[PollEvent]) -> std::io::Result<i64> {
            Ok(0)
        }
        fn get_frames(&mut self, _m: usize, _b: &mut [i16]) -> std::io::Result<(usize, f64)> {
            Ok((0, 0.0))
        }
    }

    #[test]
    fn start_rejects_a_hw_rate_not_divisible_by_the_requested_rate() {
        let backend = Box::new(NonDivisibleBackend { opened: false });
        // 44100 isn't an integer multiple of 48000.
        let mut dm = DeviceMinder::new("D".into(), "hw:0".into(), 48_000, backend, 0.0);
        let err = dm.start(0.0).unwrap_err();
        assert!(matches!(err, EngineError::RateNotDivisible { hw_rate: 44_100, rate: 48_000 }));
        assert!(!dm.backend.is_open());
    }
}
