//! Stall and disconnect watchdog
//!
//! The monitor only looks at timing: a position that stops advancing while
//! the machine says `Playing` is a stall, and a stall that does not clear
//! within the buffer timeout is a lost connection. It returns verdicts and
//! leaves the transitions to the session.

use std::time::Duration;

use tokio::time::Instant;

use crate::settings::HeartbeatSettings;
use crate::state_machine::PlaybackState;

/// Outcome of feeding the monitor a sample or tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Nothing to do
    Healthy,
    /// No progress for the stall threshold: enter `Buffering`
    Stalled,
    /// Progress resumed after a stall: back to `Playing`
    Recovered,
    /// Stalled for the whole buffer timeout: enter `Error`
    ConnectionLost { stalled_for: Duration },
    /// Backend paused on its own: settle on `Ready`
    UnexpectedStop,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    stall_threshold: Duration,
    buffer_timeout: Duration,
    last_position: Option<Duration>,
    last_progress_at: Option<Instant>,
    /// Set only when this monitor put the machine into `Buffering`
    buffering_since: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(settings: &HeartbeatSettings) -> Self {
        Self {
            stall_threshold: settings.stall_threshold,
            buffer_timeout: settings.buffer_timeout,
            last_position: None,
            last_progress_at: None,
            buffering_since: None,
        }
    }

    /// Restart progress tracking from `position`
    ///
    /// Called whenever playback (re)starts or jumps, so a seek never looks
    /// like a stall.
    pub fn reset(&mut self, position: Duration, now: Instant) {
        self.last_position = Some(position);
        self.last_progress_at = Some(now);
        self.buffering_since = None;
    }

    /// Forget everything; the monitor is dormant until the next `reset`
    pub fn disarm(&mut self) {
        self.last_position = None;
        self.last_progress_at = None;
        self.buffering_since = None;
    }

    /// Whether the current `Buffering` state was entered by this monitor
    pub fn owns_buffering(&self) -> bool {
        self.buffering_since.is_some()
    }

    /// A time update from the backend
    pub fn on_sample(
        &mut self,
        state: PlaybackState,
        position: Duration,
        now: Instant,
    ) -> HeartbeatVerdict {
        if !self.is_watching(state) {
            return HeartbeatVerdict::Healthy;
        }

        let progressed = match self.last_position {
            Some(last) => position > last,
            None => {
                self.reset(position, now);
                return HeartbeatVerdict::Healthy;
            }
        };

        if progressed {
            self.last_position = Some(position);
            self.last_progress_at = Some(now);
            if self.buffering_since.take().is_some() {
                tracing::info!("Playback progressing again at {:?}", position);
                return HeartbeatVerdict::Recovered;
            }
            return HeartbeatVerdict::Healthy;
        }

        self.check_timeouts(state, now)
    }

    /// Periodic check when no samples arrive
    pub fn on_tick(&mut self, state: PlaybackState, now: Instant) -> HeartbeatVerdict {
        if !self.is_watching(state) || self.last_progress_at.is_none() {
            return HeartbeatVerdict::Healthy;
        }
        self.check_timeouts(state, now)
    }

    /// Backend reported a pause
    ///
    /// `expected` is true when a user command or seek caused it.
    pub fn on_native_pause(&mut self, state: PlaybackState, expected: bool) -> HeartbeatVerdict {
        if state == PlaybackState::Playing && !expected {
            tracing::warn!("Backend paused without a command");
            self.disarm();
            return HeartbeatVerdict::UnexpectedStop;
        }
        HeartbeatVerdict::Healthy
    }

    fn is_watching(&self, state: PlaybackState) -> bool {
        match state {
            PlaybackState::Playing => true,
            PlaybackState::Buffering => self.owns_buffering(),
            _ => false,
        }
    }

    fn check_timeouts(&mut self, state: PlaybackState, now: Instant) -> HeartbeatVerdict {
        if let Some(since) = self.buffering_since {
            let stalled_for = now.saturating_duration_since(since);
            if state == PlaybackState::Buffering && stalled_for >= self.buffer_timeout {
                tracing::error!("No playback progress for {:?}, giving up", stalled_for);
                self.disarm();
                return HeartbeatVerdict::ConnectionLost { stalled_for };
            }
            return HeartbeatVerdict::Healthy;
        }

        let Some(last_progress) = self.last_progress_at else {
            return HeartbeatVerdict::Healthy;
        };
        if state == PlaybackState::Playing
            && now.saturating_duration_since(last_progress) >= self.stall_threshold
        {
            tracing::warn!(
                "Playback stalled at {:?}",
                self.last_position.unwrap_or_default()
            );
            self.buffering_since = Some(now);
            return HeartbeatVerdict::Stalled;
        }
        HeartbeatVerdict::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(&HeartbeatSettings::default())
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn progress_is_healthy() {
        let start = Instant::now();
        let mut hb = monitor();
        hb.reset(secs(0), start);
        for i in 1..10 {
            assert_eq!(
                hb.on_sample(PlaybackState::Playing, secs(i), start + secs(i)),
                HeartbeatVerdict::Healthy
            );
        }
    }

    #[test]
    fn stall_then_recover() {
        let start = Instant::now();
        let mut hb = monitor();
        hb.reset(secs(10), start);

        assert_eq!(
            hb.on_tick(PlaybackState::Playing, start + secs(3)),
            HeartbeatVerdict::Healthy
        );
        assert_eq!(
            hb.on_sample(PlaybackState::Playing, secs(10), start + secs(4)),
            HeartbeatVerdict::Stalled
        );
        assert!(hb.owns_buffering());
        assert_eq!(
            hb.on_sample(PlaybackState::Buffering, secs(11), start + secs(6)),
            HeartbeatVerdict::Recovered
        );
        assert!(!hb.owns_buffering());
    }

    #[test]
    fn stall_then_connection_lost() {
        let start = Instant::now();
        let mut hb = monitor();
        hb.reset(secs(0), start);

        assert_eq!(
            hb.on_tick(PlaybackState::Playing, start + secs(4)),
            HeartbeatVerdict::Stalled
        );
        assert_eq!(
            hb.on_tick(PlaybackState::Buffering, start + secs(23)),
            HeartbeatVerdict::Healthy
        );
        assert_eq!(
            hb.on_tick(PlaybackState::Buffering, start + secs(24)),
            HeartbeatVerdict::ConnectionLost {
                stalled_for: secs(20)
            }
        );
    }

    #[test]
    fn ignores_buffering_it_did_not_start() {
        let start = Instant::now();
        let mut hb = monitor();
        hb.reset(secs(0), start);
        assert_eq!(
            hb.on_tick(PlaybackState::Buffering, start + secs(60)),
            HeartbeatVerdict::Healthy
        );
    }

    #[test]
    fn unexpected_pause() {
        let mut hb = monitor();
        assert_eq!(
            hb.on_native_pause(PlaybackState::Playing, false),
            HeartbeatVerdict::UnexpectedStop
        );
        assert_eq!(
            hb.on_native_pause(PlaybackState::Playing, true),
            HeartbeatVerdict::Healthy
        );
        assert_eq!(
            hb.on_native_pause(PlaybackState::Seeking, false),
            HeartbeatVerdict::Healthy
        );
    }
}
