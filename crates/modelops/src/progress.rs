use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

pub const EMIT_EVERY: Duration = Duration::from_secs(1);

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)%").expect("valid regex"))
}

/// Last `NN%` figure on a progress line, clamped to 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    percent_re()
        .captures_iter(line)
        .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .last()
        .map(|p| p.min(100) as u8)
}

/// Throttles progress updates and derives speed/ETA from elapsed time.
#[derive(Debug)]
pub struct ProgressMeter {
    started: Instant,
    last_emit: Option<Instant>,
    every: Duration,
}

impl ProgressMeter {
    pub fn new(started: Instant, every: Duration) -> Self {
        Self {
            started,
            last_emit: None,
            every,
        }
    }

    /// True at most once per interval. The first call always emits.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(prev) if now.duration_since(prev) < self.every => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// `(percent per second, seconds remaining)`.
    pub fn rates(&self, progress: u8, now: Instant) -> (f64, Option<u64>) {
        let elapsed = now.duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 || progress == 0 {
            return (0.0, None);
        }
        let speed = progress as f64 / elapsed;
        let eta = (100.0 - progress as f64) / speed;
        (speed, Some(eta.round() as u64))
    }
}
