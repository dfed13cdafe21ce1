use anyhow::{Result, anyhow, bail};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::debug;

/// Hands out proxy ports for newly created service instances.
pub trait PortAllocator: Send + Sync {
    /// Next free port. `0` means "let the OS choose".
    fn allocate_next(&self) -> Result<u16>;

    fn release(&self, port: u16);
}

/// Inclusive-exclusive port range `[base, base + size)`. An empty range
/// means ports are chosen by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRange {
    pub base: u16,
    pub size: u16,
}

impl PortRange {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && (port as u32) < self.base as u32 + self.size as u32
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    /// Accepts `""`, `"base-last"` or `"base+size"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| anyhow!("Invalid port range: {}", s))
        };
        let (base, size) = if let Some((base, last)) = s.split_once('-') {
            let (base, last) = (parse(base)?, parse(last)?);
            if last < base {
                bail!("Invalid port range: {}", s);
            }
            (base, last as u32 - base as u32 + 1)
        } else if let Some((base, size)) = s.split_once('+') {
            (parse(base)?, parse(size)? as u32)
        } else {
            bail!("Invalid port range: {}", s);
        };
        if base == 0 || base as u32 + size > u16::MAX as u32 + 1 || size > u16::MAX as u32 {
            bail!("Invalid port range: {}", s);
        }
        Ok(Self {
            base,
            size: size as u16,
        })
    }
}

struct AllocState {
    used: Vec<bool>,
    next: usize,
}

/// Sequential allocator over a `PortRange`, resuming after the last grant.
pub struct RangePortAllocator {
    range: PortRange,
    state: Mutex<AllocState>,
}

impl RangePortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            state: Mutex::new(AllocState {
                used: vec![false; range.size as usize],
                next: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of ports currently handed out.
    pub fn allocated(&self) -> usize {
        self.state().used.iter().filter(|u| **u).count()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.range.contains(port) && self.state().used[(port - self.range.base) as usize]
    }
}

impl PortAllocator for RangePortAllocator {
    fn allocate_next(&self) -> Result<u16> {
        if self.range.is_empty() {
            return Ok(0);
        }
        let mut state = self.state();
        let size = state.used.len();
        for i in 0..size {
            let idx = (state.next + i) % size;
            if !state.used[idx] {
                state.used[idx] = true;
                state.next = (idx + 1) % size;
                let port = self.range.base + idx as u16;
                debug!("Allocated proxy port {}", port);
                return Ok(port);
            }
        }
        bail!(
            "port allocation failed; all {} ports from {} are in use",
            size,
            self.range.base
        )
    }

    fn release(&self, port: u16) {
        if !self.range.contains(port) {
            return;
        }
        self.state().used[(port - self.range.base) as usize] = false;
    }
}
