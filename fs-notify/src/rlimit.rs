//! Open-descriptor limit handling.
//!
//! Backends that hold one descriptor per watched directory run out of
//! descriptors long before they run out of anything else. The soft limit is
//! raised to the hard limit once per process and the result is cached so the
//! registry can refuse registrations before the OS does.

use std::io;
use std::sync::OnceLock;

#[cfg(unix)]
use nix::sys::resource::{self, Resource};
use tracing::{debug, warn};

/// Soft and hard descriptor limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub soft: u64,
    pub hard: u64,
}

/// Where descriptor limits are read from and written to.
pub trait LimitSource {
    /// Read the current limits.
    fn get(&self) -> io::Result<Rlimit>;

    /// Apply new limits.
    fn set(&self, limit: Rlimit) -> io::Result<()>;
}

/// The process limits (`RLIMIT_NOFILE`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLimits;

#[cfg(unix)]
impl LimitSource for SystemLimits {
    fn get(&self) -> io::Result<Rlimit> {
        let (soft, hard) = resource::getrlimit(Resource::RLIMIT_NOFILE)?;
        Ok(Rlimit {
            soft: u64::from(soft),
            hard: u64::from(hard),
        })
    }

    fn set(&self, limit: Rlimit) -> io::Result<()> {
        let soft = resource::rlim_t::try_from(limit.soft).unwrap_or(resource::RLIM_INFINITY);
        let hard = resource::rlim_t::try_from(limit.hard).unwrap_or(resource::RLIM_INFINITY);
        resource::setrlimit(Resource::RLIMIT_NOFILE, soft, hard)?;
        Ok(())
    }
}

#[cfg(not(unix))]
impl LimitSource for SystemLimits {
    fn get(&self) -> io::Result<Rlimit> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "descriptor limits are not exposed on this platform",
        ))
    }

    fn set(&self, _limit: Rlimit) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "descriptor limits are not exposed on this platform",
        ))
    }
}

/// Raises the soft limit to the hard limit and returns the limit now in
/// effect. Failures are logged and swallowed: an unreadable limit yields 0
/// (unknown), a refused raise keeps the old soft limit.
pub fn raise(source: &impl LimitSource) -> u64 {
    let limit = match source.get() {
        Ok(limit) => limit,
        Err(e) => {
            warn!("Failed to read descriptor limit: {e}");
            return 0;
        }
    };

    if limit.soft >= limit.hard {
        return limit.soft;
    }

    let raised = Rlimit {
        soft: limit.hard,
        hard: limit.hard,
    };
    match source.set(raised) {
        Ok(()) => {
            debug!(
                "Raised descriptor limit from {} to {}",
                limit.soft, limit.hard
            );
            limit.hard
        }
        Err(e) => {
            warn!("Failed to raise descriptor limit to {}: {e}", limit.hard);
            limit.soft
        }
    }
}

/// A one-shot cache of the effective descriptor limit.
#[derive(Debug, Default)]
pub struct LimitCell {
    value: OnceLock<u64>,
}

impl LimitCell {
    /// Create an unset cell.
    pub const fn new() -> Self {
        Self {
            value: OnceLock::new(),
        }
    }

    /// Run [`raise`] the first time this is called, from any thread, and
    /// return the cached result on every call.
    pub fn raise_and_cache(&self, source: &impl LimitSource) -> u64 {
        *self.value.get_or_init(|| raise(source))
    }

    /// The cached limit, or 0 before [`LimitCell::raise_and_cache`] has run.
    pub fn get(&self) -> u64 {
        self.value.get().copied().unwrap_or(0)
    }
}

static PROCESS_LIMIT: LimitCell = LimitCell::new();

/// Raise the process descriptor limit once and cache it.
pub fn raise_and_cache() -> u64 {
    PROCESS_LIMIT.raise_and_cache(&SystemLimits)
}

/// The cached process descriptor limit, 0 if unknown or not yet raised.
pub fn effective_limit() -> u64 {
    PROCESS_LIMIT.get()
}
