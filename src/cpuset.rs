use crate::error::CpuManagerError;
use crate::topology::{CpuTopology, TopologyLevel};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Highest CPU id accepted when parsing; matches the kernel's `NR_CPUS` ceiling.
pub const MAX_CPU_ID: usize = 8191;

static RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(?:-(\d+))?$").expect("cpu range pattern is valid"));

/// An immutable set of logical CPU ids.
///
/// Iteration is always ascending, so anything that walks a `CpuSet` to break
/// ties is deterministic. Every operation returns a new set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// The empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from a list of ids, dropping duplicates.
    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I) -> Self {
        cpus.into_iter().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    #[must_use]
    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    /// True if every CPU of `self` is also in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    #[must_use]
    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.cpus.is_disjoint(&other.cpus)
    }

    #[must_use]
    pub fn union(&self, other: &CpuSet) -> CpuSet {
        self.cpus.union(&other.cpus).copied().collect()
    }

    /// Union of `self` with every set in `others`.
    #[must_use]
    pub fn union_all<'a, I: IntoIterator<Item = &'a CpuSet>>(&self, others: I) -> CpuSet {
        let mut cpus = self.cpus.clone();
        for other in others {
            cpus.extend(other.cpus.iter().copied());
        }
        CpuSet { cpus }
    }

    #[must_use]
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        self.cpus.difference(&other.cpus).copied().collect()
    }

    #[must_use]
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        self.cpus.intersection(&other.cpus).copied().collect()
    }

    /// Keeps the CPUs matching `predicate`.
    #[must_use]
    pub fn filter<F: Fn(usize) -> bool>(&self, predicate: F) -> CpuSet {
        self.cpus.iter().copied().filter(|&cpu| predicate(cpu)).collect()
    }

    /// Keeps the CPUs that belong to group `id` at `level` of `topology`.
    #[must_use]
    pub fn filter_by_topology(&self, topology: &CpuTopology, level: TopologyLevel, id: usize) -> CpuSet {
        self.filter(|cpu| topology.group_of(cpu, level) == Some(id))
    }

    /// Ascending iterator over the ids.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    /// The ids as an ascending vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    /// Parses the Linux cpu list format, e.g. `0-3,8,10-11`.
    ///
    /// An empty (or all-whitespace) string is the empty set.
    pub fn parse(s: &str) -> Result<CpuSet, CpuManagerError> {
        let invalid = |reason: String| CpuManagerError::InvalidCpuSet {
            input: s.to_string(),
            reason,
        };

        let mut cpus = BTreeSet::new();
        if s.trim().is_empty() {
            return Ok(CpuSet { cpus });
        }

        for part in s.split(',') {
            let part = part.trim();
            let caps = RANGE_RE
                .captures(part)
                .ok_or_else(|| invalid(format!("malformed element {part:?}")))?;

            let start: usize = caps[1]
                .parse()
                .map_err(|e| invalid(format!("{part:?}: {e}")))?;
            let end: usize = match caps.get(2) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|e| invalid(format!("{part:?}: {e}")))?,
                None => start,
            };

            if end < start {
                return Err(invalid(format!("reversed range {part:?}")));
            }
            if end > MAX_CPU_ID {
                return Err(invalid(format!("cpu {end} is above {MAX_CPU_ID}")));
            }
            cpus.extend(start..=end);
        }

        Ok(CpuSet { cpus })
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        CpuSet {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = usize;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.cpus.iter().copied()
    }
}

impl FromStr for CpuSet {
    type Err = CpuManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CpuSet::parse(s)
    }
}

/// Linux list format with contiguous runs collapsed: `0-3,8,10-11`.
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.cpus.iter().copied().peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;

            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CpuSet::parse(&s).map_err(serde::de::Error::custom)
    }
}
