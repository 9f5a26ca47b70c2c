//! ALSA capture backend: opens a hw/plughw PCM in blocking, interleaved
//! S16_LE mode and exposes it through the [`super::Backend`] contract.
//!
//! Grounded on the `alsa` crate's own idiom (`HwParams`, `set_access`,
//! `io_i16().readi`) rather than a literal mmap_begin/commit transcription
//! -- the crate's safe `PollDescriptors`/`io_i16` surface is the
//! established way real Rust ALSA consumers drive capture, and the
//! backend contract here only promises interleaved i16 frames out, not a
//! specific ALSA access mode.

use std::os::unix::io::RawFd;

use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction, PollDescriptors, ValueOr};

use super::Backend;
use crate::clock::{monotonic_now, realtime_now};
use crate::registry::PollEvent;

/// Requested period size in frames; matches the source's fixed capture
/// period rather than deriving one from the negotiated rate.
const PERIOD_FRAMES: alsa::pcm::Frames = 4800;
/// Requested ring buffer size in frames.
const BUFFER_FRAMES: alsa::pcm::Frames = 131_072;
/// How many multiples of the requested rate to try before giving up on
/// finding a hardware rate evenly divisible by it.
const MAX_RATE_MULTIPLIER: u32 = 16;

pub struct AlsaBackend {
    device_name: String,
    target_rate: u32,
    channels: u8,
    pcm: Option<PCM>,
    hw_rate: u32,
    poll_fds: Vec<RawFd>,
    started: bool,
}

impl AlsaBackend {
    pub fn new(device_name: String, target_rate: u32, channels: u8) -> Self {
        AlsaBackend {
            device_name,
            target_rate,
            channels,
            pcm: None,
            hw_rate: target_rate,
            poll_fds: Vec::new(),
            started: false,
        }
    }

    fn open(&mut self) -> std::io::Result<()> {
        let pcm = PCM::new(&self.device_name, Direction::Capture, false)
            .map_err(alsa_err_to_io)?;

        let hw_rate = negotiate_rate(&pcm, self.target_rate, self.channels).map_err(alsa_err_to_io)?;

        {
            let hwp = HwParams::any(&pcm).map_err(alsa_err_to_io)?;
            hwp.set_access(Access::RWInterleaved).map_err(alsa_err_to_io)?;
            hwp.set_format(Format::s16()).map_err(alsa_err_to_io)?;
            hwp.set_channels(self.channels as u32).map_err(alsa_err_to_io)?;
            hwp.set_rate(hw_rate, ValueOr::Nearest).map_err(alsa_err_to_io)?;
            hwp.set_period_size_near(PERIOD_FRAMES, ValueOr::Nearest)
                .map_err(alsa_err_to_io)?;
            hwp.set_buffer_size_near(BUFFER_FRAMES).map_err(alsa_err_to_io)?;
            pcm.hw_params(&hwp).map_err(alsa_err_to_io)?;
        }

        let actual = pcm
            .hw_params_current()
            .and_then(|p| p.get_rate())
            .map_err(alsa_err_to_io)?;

        pcm.prepare().map_err(alsa_err_to_io)?;

        let count = PollDescriptors::count(&pcm);
        let mut fds = vec![libc::pollfd { fd: 0, events: 0, revents: 0 }; count];
        let filled = PollDescriptors::fill(&pcm, &mut fds).map_err(alsa_err_to_io)?;
        fds.truncate(filled);

        self.poll_fds = fds.iter().map(|p| p.fd as RawFd).collect();
        self.hw_rate = actual;
        self.pcm = Some(pcm);
        self.started = false;
        Ok(())
    }
}

/// Search rates `target_rate * k` for `k` in `1..=MAX_RATE_MULTIPLIER`,
/// keeping the first one the driver reports back unchanged -- the search
/// the source performs to land on a hardware rate evenly divisible by the
/// stream's working rate so decimation stays an exact integer ratio.
fn negotiate_rate(pcm: &PCM, target_rate: u32, channels: u8) -> alsa::Result<u32> {
    for k in 1..=MAX_RATE_MULTIPLIER {
        let candidate = target_rate * k;
        let hwp = HwParams::any(pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::s16())?;
        hwp.set_channels(channels as u32)?;
        if hwp.set_rate(candidate, ValueOr::Nearest).is_err() {
            continue;
        }
        if let Ok(got) = hwp.get_rate() {
            if got == candidate {
                return Ok(candidate);
            }
        }
    }
    // Fall back to whatever the driver would pick nearest the plain
    // target rate if no exact multiple was achievable.
    let hwp = HwParams::any(pcm)?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::s16())?;
    hwp.set_channels(channels as u32)?;
    hwp.set_rate(target_rate, ValueOr::Nearest)?;
    hwp.get_rate()
}

fn alsa_err_to_io(e: alsa::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

impl Backend for AlsaBackend {
    fn poll_fds(&self) -> Vec<(RawFd, mio::Interest)> {
        self.poll_fds.iter().map(|&fd| (fd, mio::Interest::READABLE)).collect()
    }

    fn is_open(&self) -> bool {
        self.pcm.is_some()
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
        let Some(pcm) = &self.pcm else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "device not open"));
        };
        if !self.started {
            if pcm.state() == State::Prepared {
                pcm.start().map_err(alsa_err_to_io)?;
            }
            self.started = true;
        }
        Ok(())
    }

    fn do_stop(&mut self) {
        // Dropping the `PCM` handle closes the underlying device; the
        // crate has no separate explicit close call.
        self.started = false;
        self.pcm = None;
        self.poll_fds.clear();
    }

    fn do_restart(&mut self) -> std::io::Result<()> {
        self.do_stop();
        self.open()
    }

    fn handle_events(&mut self, _events: &[PollEvent]) -> std::io::Result<i64> {
        let Some(pcm) = &self.pcm else {
            return Ok(0);
        };
        match pcm.avail_update() {
            Ok(avail) => Ok(avail as i64),
            Err(e) => {
                if e.errno() == libc::EPIPE {
                    pcm.prepare().map_err(alsa_err_to_io)?;
                    return Ok(0);
                }
                Err(alsa_err_to_io(e))
            }
        }
    }

    fn get_frames(&mut self, max_frames: usize, buf: &mut [i16]) -> std::io::Result<(usize, f64)> {
        let Some(pcm) = &self.pcm else {
            return Ok((0, monotonic_now()));
        };
        let io = pcm.io_i16().map_err(alsa_err_to_io)?;
        let nchan = self.channels as usize;
        let slice = &mut buf[..max_frames * nchan];
        let got = match io.readi(slice) {
            Ok(n) => n,
            Err(e) => {
                if e.errno() == libc::EPIPE {
                    pcm.prepare().map_err(alsa_err_to_io)?;
                    return Ok((0, monotonic_now()));
                }
                return Err(alsa_err_to_io(e));
            }
        };
        // Software htimestamp: wall-clock "now" backdated by the time this
        // period took to fill, approximating `snd_pcm_htimestamp`'s
        // CLOCK_REALTIME reading for the period's first frame.
        let timestamp = realtime_now() - (got as f64 / self.hw_rate as f64);
        Ok((got, timestamp))
    }
}
