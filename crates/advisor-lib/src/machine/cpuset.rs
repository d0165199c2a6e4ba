//! Logical CPU sets
//!
//! A `CpuSet` is an ordered set of logical CPU ids. Set operations return new
//! sets and never mutate their operands, so a set handed to another component
//! can be treated as immutable.

use crate::error::{AdvisorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Largest CPU id accepted when parsing; matches the kernel's `NR_CPUS` ceiling
pub const MAX_CPU_ID: usize = 8191;

/// Set of logical CPU ids
///
/// Serialized in the Linux cpu-list format (`"0-3,8,10-11"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of CPUs in the set
    pub fn size(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    /// Iterate CPU ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        CpuSet {
            cpus: self.cpus.union(&other.cpus).copied().collect(),
        }
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet {
            cpus: self.cpus.intersection(&other.cpus).copied().collect(),
        }
    }

    /// CPUs in `self` that are not in `other`
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        CpuSet {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.cpus.is_subset(&other.cpus)
    }

    /// Union of any number of sets
    pub fn union_all<'a>(sets: impl IntoIterator<Item = &'a CpuSet>) -> CpuSet {
        sets.into_iter()
            .fold(CpuSet::new(), |acc, set| acc.union(set))
    }

    /// Parse the Linux cpu-list format, e.g. `"0-3,8"`
    pub fn parse(s: &str) -> Result<Self> {
        let mut cpus = BTreeSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(CpuSet::new());
        }

        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_cpu_id(start, s)?;
                    let end = parse_cpu_id(end, s)?;
                    if start > end {
                        return Err(AdvisorError::CpuSetParse(format!(
                            "invalid range {} in {:?}",
                            part, s
                        )));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    cpus.insert(parse_cpu_id(part, s)?);
                }
            }
        }

        Ok(CpuSet { cpus })
    }
}

fn parse_cpu_id(token: &str, input: &str) -> Result<usize> {
    let cpu: usize = token
        .trim()
        .parse()
        .map_err(|_| AdvisorError::CpuSetParse(format!("invalid cpu id {:?} in {:?}", token, input)))?;
    if cpu > MAX_CPU_ID {
        return Err(AdvisorError::CpuSetParse(format!(
            "cpu id {} in {:?} exceeds {}",
            cpu, input, MAX_CPU_ID
        )));
    }
    Ok(cpu)
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        CpuSet {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl FromStr for CpuSet {
    type Err = AdvisorError;

    fn from_str(s: &str) -> Result<Self> {
        CpuSet::parse(s)
    }
}

impl TryFrom<String> for CpuSet {
    type Error = AdvisorError;

    fn try_from(value: String) -> Result<Self> {
        CpuSet::parse(&value)
    }
}

impl From<CpuSet> for String {
    fn from(set: CpuSet) -> Self {
        set.to_string()
    }
}

impl fmt::Display for CpuSet {
    /// Renders contiguous runs as ranges
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for cpu in self.iter() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }

        let rendered: Vec<String> = ranges
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{}-{}", start, end)
                }
            })
            .collect();

        write!(f, "{}", rendered.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let a: CpuSet = (0..4).collect();
        let b: CpuSet = (2..6).collect();

        assert_eq!(a.union(&b), (0..6).collect());
        assert_eq!(a.intersection(&b), (2..4).collect());
        assert_eq!(a.difference(&b), (0..2).collect());
        assert_eq!(a.size(), 4);

        // operands are untouched
        assert_eq!(a, (0..4).collect());
        assert_eq!(b, (2..6).collect());
    }

    #[test]
    fn test_parse_cpu_list() {
        let set = CpuSet::parse("0-3,8,10-11").unwrap();
        assert_eq!(set.size(), 7);
        assert!(set.contains(8));
        assert!(!set.contains(9));
        assert_eq!(set.to_string(), "0-3,8,10-11");
    }

    #[test]
    fn test_parse_empty_and_whitespace() {
        assert!(CpuSet::parse("").unwrap().is_empty());
        assert!(CpuSet::parse("  \n").unwrap().is_empty());
        assert_eq!(CpuSet::parse("0-1\n").unwrap().size(), 2);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            CpuSet::parse("0-x"),
            Err(AdvisorError::CpuSetParse(_))
        ));
        assert!(matches!(
            CpuSet::parse("5-2"),
            Err(AdvisorError::CpuSetParse(_))
        ));
        assert!(CpuSet::parse("1,,2").is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_ids() {
        assert!(matches!(
            CpuSet::parse("0-4000000000"),
            Err(AdvisorError::CpuSetParse(_))
        ));
        assert!(CpuSet::parse("8192").is_err());
        assert!(serde_json::from_str::<CpuSet>("\"0-4000000000\"").is_err());

        let widest = CpuSet::parse(&format!("0-{}", MAX_CPU_ID)).unwrap();
        assert_eq!(widest.size(), MAX_CPU_ID + 1);
    }

    #[test]
    fn test_serde_uses_cpu_list() {
        let set = CpuSet::parse("0-2,7").unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"0-2,7\"");

        let back: CpuSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_union_all() {
        let sets = vec![
            CpuSet::parse("0-1").unwrap(),
            CpuSet::parse("4").unwrap(),
            CpuSet::new(),
        ];
        assert_eq!(CpuSet::union_all(&sets).to_string(), "0-1,4");
    }
}
