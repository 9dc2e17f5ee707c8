use std::time::{Duration, Instant};

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// The wait time between retries is a random value between zero and the
/// current "retry envelope". The envelope starts at `initial` and grows by
/// `multiplier` on every call to [`Backoff::duration`], capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Initial value of the retry envelope.
    pub initial: Duration,
    /// Ceiling on the retry envelope.
    pub max: Duration,
    /// Growth factor applied to the envelope after each call. Should be > 1.
    pub multiplier: f64,
    /// Total time since the first call after which `duration` gives up.
    pub timeout: Duration,

    cur: Duration,
    started: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, timeout: Duration) -> Self {
        Backoff {
            initial,
            max,
            multiplier,
            timeout,
            cur: Duration::ZERO,
            started: None,
        }
    }

    /// Returns the next backoff duration, or `None` once `timeout` has
    /// elapsed since the first call.
    pub fn duration(&mut self) -> Option<Duration> {
        if self.initial.is_zero() {
            self.initial = Duration::from_secs(1);
        }
        if self.cur.is_zero() {
            self.cur = self.initial;
        }
        if self.max.is_zero() {
            self.max = Duration::from_secs(30);
        }
        if self.multiplier < 1.0 {
            self.multiplier = 2.0;
        }

        match self.started {
            None => self.started = Some(Instant::now()),
            Some(start) => {
                if start.elapsed() > self.timeout {
                    return None;
                }
            }
        }

        let mut rng = rand::thread_rng();
        let envelope_nanos = self.cur.as_nanos().max(1);
        let chosen = Duration::from_nanos(rng.gen_range(0..envelope_nanos) as u64);

        let grown = (self.cur.as_nanos() as f64 * self.multiplier) as u64;
        self.cur = Duration::from_nanos(grown).min(self.max);

        Some(chosen)
    }

    pub fn reset(&mut self) {
        self.cur = Duration::ZERO;
        self.started = None;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(
            Duration::from_millis(250),
            Duration::from_millis(32_000),
            1.30,
            Duration::from_millis(32_000),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_grows_and_is_capped() {
        let mut b = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
            Duration::from_secs(3600),
        );
        for _ in 0..20 {
            let d = b.duration().expect("not timed out");
            assert!(d <= Duration::from_millis(40));
        }
    }

    #[test]
    fn zero_initial_falls_back_to_default_envelope() {
        let mut b = Backoff::new(
            Duration::ZERO,
            Duration::from_millis(0),
            0.0,
            Duration::from_secs(60),
        );
        let d = b.duration().unwrap();
        assert!(d <= Duration::from_secs(1));
    }

    #[test]
    fn expires_after_timeout() {
        let mut b = Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            1.0,
            Duration::from_nanos(1),
        );
        b.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert!(b.duration().is_none());
    }
}
