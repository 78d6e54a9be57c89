//! Deterministic port partitioning.
//!
//! Every worker process computes the same table from the same inputs: the
//! full sorted module list and the current hour. No coordination happens
//! between workers. The base offset rotates hourly so tests relying on
//! fixed port numbers surface over time; a worker computing the table in a
//! different hour than its siblings may disagree with them, and that narrow
//! window is accepted.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};
use crate::module::ModuleId;

pub const DEFAULT_PORT_MIN: u16 = 5001;
pub const DEFAULT_PORT_MAX: u16 = 32767;
pub const DEFAULT_PORTS_PER_TEST: u16 = 20;
/// Smallest width that still fits every named port.
pub const MIN_PORTS_PER_TEST: u16 = 13;

const ROTATION_PERIOD_SECS: u64 = 3600;
const EXTRA_PORTS: usize = 8;

/// Global port floor/ceiling and the width handed to each module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpace {
    pub min: u16,
    pub max: u16,
    pub per_module: u16,
}

impl Default for PortSpace {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
            per_module: DEFAULT_PORTS_PER_TEST,
        }
    }
}

/// Contiguous block of ports owned by one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub base: u16,
    pub width: u16,
}

impl PortRange {
    /// Last port of the range (inclusive).
    pub fn last(&self) -> u16 {
        self.base + self.width - 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && port <= self.last()
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }

    /// Well-known ports handed to servers and scripts, at fixed offsets.
    pub fn named_ports(&self) -> NamedPorts {
        let mut extra = [0u16; EXTRA_PORTS];
        for (i, port) in extra.iter_mut().enumerate() {
            *port = self.base + 4 + i as u16;
        }
        NamedPorts {
            port: self.base,
            tls: self.base + 1,
            http: self.base + 2,
            https: self.base + 3,
            extra,
            control: self.base + 12,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}, {}>", self.base, self.last())
    }
}

/// Port numbers exposed through the process environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedPorts {
    pub port: u16,
    pub tls: u16,
    pub http: u16,
    pub https: u16,
    pub extra: [u16; EXTRA_PORTS],
    pub control: u16,
}

impl NamedPorts {
    /// Environment variables in the form lifecycle scripts expect.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("PORT".to_string(), self.port.to_string()),
            ("TLSPORT".to_string(), self.tls.to_string()),
            ("HTTPPORT".to_string(), self.http.to_string()),
            ("HTTPSPORT".to_string(), self.https.to_string()),
        ];
        for (i, port) in self.extra.iter().enumerate() {
            vars.push((format!("EXTRAPORT{}", i + 1), port.to_string()));
        }
        vars.push(("CONTROLPORT".to_string(), self.control.to_string()));
        vars
    }
}

/// Hour bucket used to rotate the base offset.
pub fn rotation_bucket(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() / ROTATION_PERIOD_SECS)
        .unwrap_or(0)
}

/// Port range of every known module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    ranges: BTreeMap<ModuleId, PortRange>,
    offset: u16,
}

impl PortAssignment {
    /// Assign a disjoint range to each module.
    ///
    /// `modules` must be the complete module list, not only the modules
    /// selected for this run, so that independently started workers agree on
    /// offsets. The list is sorted and deduplicated here; position in the
    /// sorted order determines the offset.
    pub fn allocate(
        modules: &[ModuleId],
        space: &PortSpace,
        now: SystemTime,
    ) -> HarnessResult<Self> {
        let mut sorted: Vec<&ModuleId> = modules.iter().collect();
        sorted.sort();
        sorted.dedup();

        let width = u64::from(space.per_module);
        let required = sorted.len() as u64 * width;
        let top = i64::from(space.max) - required as i64;
        let usable = top - i64::from(space.min);
        if width == 0 || usable < 0 {
            return Err(HarnessError::Capacity {
                modules: sorted.len(),
                required,
                available: u64::from(space.max.saturating_sub(space.min)),
            });
        }

        let offset = match usable as u64 {
            0 => 0,
            usable => rotation_bucket(now) % usable,
        };

        let ranges = sorted
            .into_iter()
            .enumerate()
            .map(|(index, module)| {
                let base = u64::from(space.min) + offset + index as u64 * width;
                (
                    module.clone(),
                    PortRange {
                        base: base as u16,
                        width: space.per_module,
                    },
                )
            })
            .collect();

        Ok(Self {
            ranges,
            offset: offset as u16,
        })
    }

    pub fn get(&self, module: &ModuleId) -> Option<PortRange> {
        self.ranges.get(module).copied()
    }

    /// Rotation offset applied on top of the port floor.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModuleId, &PortRange)> {
        self.ranges.iter()
    }
}
