use std::time::Instant;

/// Host clock used for system-time fallbacks and notification stamps.
pub trait TimeService: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Milliseconds elapsed since the service was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeService {
    epoch: Instant,
}

impl SystemTimeService {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeService for SystemTimeService {
    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}
