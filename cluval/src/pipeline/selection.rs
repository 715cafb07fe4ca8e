use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::Error;

/// Which cluster labels to process: `all`, or a comma-separated list of
/// labels and inclusive ranges such as `1-3,8`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClusterSelection {
    #[default]
    All,
    Labels(BTreeSet<u32>),
}

impl ClusterSelection {
    /// Selected labels among `1..=num_clusters`, ascending.
    pub fn resolve(&self, num_clusters: usize) -> Vec<u32> {
        let max = num_clusters as u32;
        match self {
            ClusterSelection::All => (1..=max).collect(),
            ClusterSelection::Labels(labels) => {
                let (kept, dropped): (Vec<u32>, Vec<u32>) = labels.iter().copied().partition(|&l| l <= max);
                if !dropped.is_empty() {
                    warn!(?dropped, num_clusters, "Ignoring cluster labels beyond the index");
                }
                kept
            }
        }
    }
}

impl FromStr for ClusterSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(ClusterSelection::All);
        }

        let invalid = |part: &str| Error::Config(format!("invalid cluster selection '{part}' in '{s}'"));
        let parse = |part: &str| -> Result<u32, Error> {
            match part.trim().parse::<u32>() {
                Ok(0) | Err(_) => Err(invalid(part)),
                Ok(n) => Ok(n),
            }
        };

        let mut labels = BTreeSet::new();
        for part in s.split(',') {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let (lo, hi) = (parse(lo)?, parse(hi)?);
                    if lo > hi {
                        return Err(invalid(part));
                    }
                    labels.extend(lo..=hi);
                }
                None => {
                    labels.insert(parse(part)?);
                }
            }
        }
        Ok(ClusterSelection::Labels(labels))
    }
}

impl fmt::Display for ClusterSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterSelection::All => f.write_str("all"),
            ClusterSelection::Labels(labels) => {
                let parts: Vec<String> = labels.iter().map(u32::to_string).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(s: &str) -> Vec<u32> {
        match s.parse::<ClusterSelection>().unwrap() {
            ClusterSelection::Labels(l) => l.into_iter().collect(),
            ClusterSelection::All => panic!("expected labels"),
        }
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!("all".parse::<ClusterSelection>().unwrap(), ClusterSelection::All);
        assert_eq!(labels("3-7"), vec![3, 4, 5, 6, 7]);
        assert_eq!(labels("1,4,9"), vec![1, 4, 9]);
        assert_eq!(labels("1-3,8"), vec![1, 2, 3, 8]);
        assert_eq!(labels(" 2 , 2-3 "), vec![2, 3]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "0", "a", "5-2", "1,,2", "1-", "-3"] {
            assert!(bad.parse::<ClusterSelection>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_resolve_clamps_to_index() {
        assert_eq!(ClusterSelection::All.resolve(3), vec![1, 2, 3]);
        let sel: ClusterSelection = "2,5-6".parse().unwrap();
        assert_eq!(sel.resolve(5), vec![2, 5]);
        assert_eq!(sel.to_string(), "2,5,6");
    }
}
