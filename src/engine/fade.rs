//! Gain ramp applied to every rodio voice
//!
//! Changing a sink's volume from full to zero in one step clicks. Voices are
//! wrapped in `Ramp`, and `GainControl` moves the gain linearly over a
//! number of samples instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use rodio::Source;

/// Handle for steering a `Ramp` from outside the audio callback
#[derive(Debug, Clone)]
pub struct GainControl {
    inner: Arc<GainShared>,
}

#[derive(Debug)]
struct GainShared {
    /// f32 bits
    target: AtomicU32,
    ramp_ms: AtomicU32,
    /// Bumped on every request so the source notices it
    serial: AtomicU64,
}

impl GainControl {
    pub fn new(gain: f32) -> Self {
        Self {
            inner: Arc::new(GainShared {
                target: AtomicU32::new(gain.clamp(0.0, 1.0).to_bits()),
                ramp_ms: AtomicU32::new(0),
                serial: AtomicU64::new(0),
            }),
        }
    }

    /// Move toward `gain` over `over`
    pub fn ramp_to(&self, gain: f32, over: Duration) {
        self.inner
            .target
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Release);
        self.inner
            .ramp_ms
            .store(over.as_millis().min(u32::MAX as u128) as u32, Ordering::Release);
        self.inner.serial.fetch_add(1, Ordering::AcqRel);
    }

    pub fn target(&self) -> f32 {
        f32::from_bits(self.inner.target.load(Ordering::Acquire))
    }

    fn request(&self) -> (u64, f32, u32) {
        (
            self.inner.serial.load(Ordering::Acquire),
            self.target(),
            self.inner.ramp_ms.load(Ordering::Acquire),
        )
    }
}

/// Source wrapper applying the gain from a `GainControl`
pub struct Ramp<S> {
    source: S,
    control: GainControl,
    gain: f32,
    step: f32,
    steps_left: u64,
    seen_serial: u64,
}

impl<S> Ramp<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, control: GainControl) -> Self {
        let (serial, gain, _) = control.request();
        Self {
            source,
            control,
            gain,
            step: 0.0,
            steps_left: 0,
            seen_serial: serial,
        }
    }

    fn poll_control(&mut self) {
        let (serial, target, ramp_ms) = self.control.request();
        if serial == self.seen_serial {
            return;
        }
        self.seen_serial = serial;

        // counted in samples across all channels
        let samples = self.source.sample_rate() as u64
            * self.source.channels() as u64
            * ramp_ms as u64
            / 1000;
        if samples == 0 {
            self.gain = target;
            self.steps_left = 0;
        } else {
            self.step = (target - self.gain) / samples as f32;
            self.steps_left = samples;
        }
    }
}

impl<S> Iterator for Ramp<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        self.poll_control();
        if self.steps_left > 0 {
            self.steps_left -= 1;
            self.gain = if self.steps_left == 0 {
                self.control.target()
            } else {
                self.gain + self.step
            };
        }
        self.source.next().map(|sample| sample * self.gain)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }
}

impl<S> Source for Ramp<S>
where
    S: Source<Item = f32>,
{
    fn current_span_len(&self) -> Option<usize> {
        self.source.current_span_len()
    }

    fn channels(&self) -> u16 {
        self.source.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.source.total_duration()
    }

    fn try_seek(&mut self, pos: Duration) -> Result<(), rodio::source::SeekError> {
        self.source.try_seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rodio::buffer::SamplesBuffer;

    #[test]
    fn instant_change() {
        let control = GainControl::new(1.0);
        let mut ramp = Ramp::new(SamplesBuffer::new(1, 1000, vec![1.0f32; 10]), control.clone());
        assert_eq!(ramp.next(), Some(1.0));
        control.ramp_to(0.0, Duration::ZERO);
        assert_eq!(ramp.next(), Some(0.0));
    }

    #[test]
    fn linear_ramp_reaches_target() {
        let control = GainControl::new(1.0);
        // 1 kHz mono, 10 ms ramp = 10 samples
        let mut ramp = Ramp::new(SamplesBuffer::new(1, 1000, vec![1.0f32; 20]), control.clone());
        control.ramp_to(0.0, Duration::from_millis(10));

        let out: Vec<f32> = ramp.by_ref().take(10).collect();
        assert!(out.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(out[9], 0.0);
        assert!(ramp.all(|s| s == 0.0));
    }
}
