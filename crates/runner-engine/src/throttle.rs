use std::time::Duration;

use tokio::time::Instant;

/// Hard ceiling on any computed politeness delay (robots crawl-delay may
/// still exceed it).
pub const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(120);

/// Compliant mode never loads a server beyond this percentage.
const COMPLIANT_MAX_LOAD_PCT: f64 = 50.0;

/// Per-authority politeness settings.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Lower bound of the random inter-request delay.
    pub min_delay: Duration,
    /// Upper bound of the random inter-request delay.
    pub max_delay: Duration,
    /// Target server load percentage; the post-request delay grows with
    /// the server's response time so slow servers are hit less often.
    pub max_load_pct: f64,
    /// Crawl delay published by the site's robots.txt, when known.
    pub crawl_delay: Option<Duration>,
    /// Compliant mode caps `max_load_pct` at 50 and always honours the
    /// robots crawl-delay.
    pub compliant: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_load_pct: 20.0,
            crawl_delay: None,
            compliant: true,
        }
    }
}

/// Computes each request's next-allowed time for one agent.
///
/// The controller never sleeps on the scheduler's context; it only
/// produces deadlines that the worker machinery turns into schedulable
/// delays.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    config: ThrottleConfig,
}

impl ThrottleController {
    /// Builds a controller, applying the compliant-mode load cap.
    pub fn new(mut config: ThrottleConfig) -> Self {
        if config.compliant {
            config.max_load_pct = config.max_load_pct.min(COMPLIANT_MAX_LOAD_PCT);
        }
        if config.max_delay < config.min_delay {
            config.max_delay = config.min_delay;
        }
        Self { config }
    }

    /// The settings this controller was built with (post-clamping).
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// The earliest instant the next request may start, given a request
    /// that finished at `finished` after taking `took`.
    pub fn next_allowed_after(&self, finished: Instant, took: Duration) -> Instant {
        finished + self.delay_for(took, rand::random::<f64>())
    }

    /// Pure delay computation: `random(min, max) + load_factor × took`,
    /// capped at [`MAX_THROTTLE_DELAY`], then maxed with the robots
    /// crawl-delay when one is known. `random_fraction` is the sampled
    /// value in `[0, 1]`.
    pub fn delay_for(&self, took: Duration, random_fraction: f64) -> Duration {
        let fraction = random_fraction.clamp(0.0, 1.0);
        let spread = self.config.max_delay.saturating_sub(self.config.min_delay);
        let random = self.config.min_delay + spread.mul_f64(fraction);

        let load_factor = (self.config.max_load_pct / 100.0).clamp(0.0, 1.0);
        let mut delay = random + took.mul_f64(load_factor);
        if delay > MAX_THROTTLE_DELAY {
            delay = MAX_THROTTLE_DELAY;
        }

        match self.config.crawl_delay {
            Some(crawl) if crawl > delay => crawl,
            _ => delay,
        }
    }
}
