//! Tracing setup for the daemon and the CLI.
//!
//! Console output is compact and human oriented; `json_logs` switches to one
//! JSON object per line with span context, for journald or log shippers.
//! `RUST_LOG` overrides the default `stord=<level>` filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    pub verbose: bool,
}

/// Install the global subscriber. Call once, after configuration is loaded.
pub fn init(config: LogConfig) {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stord={}", level.as_str().to_lowercase())));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}

/// Lets at most one message through per interval. Used for progress lines
/// emitted from tight loops.
pub struct LogThrottle {
    interval_ms: u64,
    /// `u64::MAX` until the first message.
    last_ms: AtomicU64,
    start: Instant,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(u64::MAX),
            start: Instant::now(),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != u64::MAX && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        // Losing the race means another thread just logged.
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_passes_and_second_is_held_back() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }
}
