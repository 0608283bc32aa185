use core::time::Duration;
use std::env;
use weft_context::StackKind;

/// Default usable stack size for spawned fibers, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 102_400;

/// Default timer resolution. Idle workers block on the event source for at
/// most one tick, so the value trades wake-up latency for idle wakeups.
pub const DEFAULT_TICK: Duration = Duration::from_millis(5);

/// Runtime construction parameters.
///
/// [`Config::from_env`] reads the `WEFT_WORKERS`,
/// `WEFT_DEFAULT_STACK_SIZE` and `WEFT_STACK_KIND` environment variables
/// on top of the defaults; unparsable values are ignored.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of OS worker threads, including the thread that calls
    /// [`Runtime::start`](crate::Runtime::start). Defaults to the
    /// available parallelism.
    pub workers: usize,
    /// Stack size for fibers that don't override it.
    pub default_stack_size: usize,
    /// Stack allocation strategy for fibers that don't override it.
    pub stack_kind: StackKind,
    /// Timer resolution; also the longest a worker blocks in the event
    /// source per poll.
    pub tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, usize::from),
            default_stack_size: DEFAULT_STACK_SIZE,
            stack_kind: StackKind::default(),
            tick: DEFAULT_TICK,
        }
    }
}

// === impl Config ===

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = parse_env::<usize>("WEFT_WORKERS")
            && workers > 0
        {
            config.workers = workers;
        }
        if let Some(stack_size) = parse_env::<usize>("WEFT_DEFAULT_STACK_SIZE")
            && stack_size > 0
        {
            config.default_stack_size = stack_size;
        }
        match env::var("WEFT_STACK_KIND").as_deref() {
            Ok("mmap") => config.stack_kind = StackKind::Mmap,
            Ok("heap") => config.stack_kind = StackKind::Heap,
            _ => {}
        }
        config
    }
}

fn parse_env<T: core::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.workers >= 1);
        assert_eq!(config.default_stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.tick, Duration::from_millis(5));
    }
}
