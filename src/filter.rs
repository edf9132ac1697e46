//! Traffic shaping filters.
//!
//! A `FilterChain` is an ordered list of shaping stages that every relayed
//! segment passes through before it is forwarded. Chains are built once at
//! configuration time and copied by value into each connection handler, so
//! handlers never share mutable filter state.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::time;
use tracing::{debug, warn};

/// Maximum number of filters one chain may hold.
pub const MAX_FILTERS: usize = 10;

/// What a filter chain decided about one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Forward the segment.
    Pass,
    /// Discard the segment entirely. No partial forwarding.
    Drop,
}

/// The shaping behavior of a single filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterKind {
    /// Hold the segment for a fixed number of milliseconds.
    Delay { ms: u64 },

    /// Discard the segment with the given probability. The decision is made
    /// once per segment, never per byte.
    Drop { rate: f64 },

    /// Limit throughput by holding each segment in proportion to its size.
    Throttle { bytes_per_sec: u64 },
}

/// One stage of a filter chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Filter {
    pub kind: FilterKind,

    /// Disabled filters stay in the chain but are skipped.
    pub enabled: bool,
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FilterKind::Delay { ms } => write!(f, "delay {} ms", ms)?,
            FilterKind::Drop { rate } => write!(f, "drop {:.2}%", rate * 100.0)?,
            FilterKind::Throttle { bytes_per_sec } => {
                write!(f, "throttle {} bytes/sec", bytes_per_sec)?
            }
        }
        if !self.enabled {
            write!(f, " (disabled)")?;
        }
        Ok(())
    }
}

/// An ordered chain of at most [`MAX_FILTERS`] filters.
///
/// Cloning a chain is a deep copy. Every handler owns its own clone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    /// Create an empty chain. An empty chain passes every segment through
    /// untouched.
    pub fn new() -> FilterChain {
        FilterChain {
            filters: Vec::new(),
        }
    }

    /// Append an already-built filter, validating its parameters.
    pub fn add(&mut self, filter: Filter) -> crate::Result<()> {
        if self.filters.len() >= MAX_FILTERS {
            return Err(format!("filter chain is full ({} filters)", MAX_FILTERS).into());
        }
        match filter.kind {
            FilterKind::Drop { rate } if !(0.0..=1.0).contains(&rate) => {
                return Err(format!("drop rate {} outside 0.0-1.0", rate).into());
            }
            FilterKind::Throttle { bytes_per_sec } if bytes_per_sec == 0 => {
                return Err("throttle rate must be positive".into());
            }
            _ => {}
        }
        self.filters.push(filter);
        Ok(())
    }

    /// Append a delay stage.
    pub fn add_delay(&mut self, ms: u64) -> crate::Result<()> {
        self.add(Filter {
            kind: FilterKind::Delay { ms },
            enabled: true,
        })
    }

    /// Append a probabilistic drop stage. `rate` must lie in 0.0-1.0.
    pub fn add_drop(&mut self, rate: f64) -> crate::Result<()> {
        self.add(Filter {
            kind: FilterKind::Drop { rate },
            enabled: true,
        })
    }

    /// Append a bandwidth throttle stage. `bytes_per_sec` must be positive.
    pub fn add_throttle(&mut self, bytes_per_sec: u64) -> crate::Result<()> {
        self.add(Filter {
            kind: FilterKind::Throttle { bytes_per_sec },
            enabled: true,
        })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain against one segment of `len` bytes.
    ///
    /// Filters run in insertion order. Delay and Throttle block the calling
    /// handler, so their effects add up along the chain. The first Drop
    /// filter whose draw comes up short-circuits the rest of the chain; each
    /// Drop filter consumes exactly one uniform draw in [0, 1) per pass, so
    /// consecutive drop stages compose as independent trials.
    pub async fn apply(&self, len: usize) -> Verdict {
        for filter in &self.filters {
            if !filter.enabled {
                continue;
            }

            match filter.kind {
                FilterKind::Delay { ms } => {
                    debug!(ms, "applying delay");
                    time::sleep(Duration::from_millis(ms)).await;
                }
                FilterKind::Drop { rate } => {
                    let draw: f64 = rand::thread_rng().gen();
                    if draw < rate {
                        warn!(rate, draw, "segment dropped");
                        return Verdict::Drop;
                    }
                }
                FilterKind::Throttle { bytes_per_sec } => {
                    let micros = len as u64 * 1_000_000 / bytes_per_sec;
                    debug!(len, micros, "applying throttle");
                    time::sleep(Duration::from_micros(micros)).await;
                }
            }
        }

        Verdict::Pass
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filters.is_empty() {
            return write!(f, "no active filters");
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", filter)?;
        }
        Ok(())
    }
}
