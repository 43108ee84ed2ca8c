use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::str::FromStr;

use crate::bucket::{bucket, queue_key};
use crate::error::ConfigError;

/// Disjoint groups of cluster hosts, indexed by bucket.
///
/// Configured as a JSON object mapping bucket indexes to host names, for example
/// `{"0": ["rabbit-dc1-1", "rabbit-dc2-1"], "1": ["rabbit-dc1-2", "rabbit-dc2-2"]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyGroups {
    groups: Vec<Vec<String>>,
    count: NonZeroUsize,
}

impl PolicyGroups {
    pub fn new(mut raw: HashMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let non_zero = NonZeroUsize::new(raw.len()).ok_or(ConfigError::NoPolicyGroups)?;
        let count = non_zero.get();

        // Keys must be exactly "0".."N-1": no gaps, no "01".
        if let Some(key) = raw.keys().find(|key| {
            key.parse::<usize>()
                .map(|index| index >= count || index.to_string() != **key)
                .unwrap_or(true)
        }) {
            return Err(ConfigError::InvalidGroupKey {
                key: key.clone(),
                count,
            });
        }

        let mut groups = Vec::with_capacity(count);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for index in 0..count {
            let hosts = raw.remove(&index.to_string()).unwrap_or_default();
            if hosts.is_empty() {
                return Err(ConfigError::EmptyGroup(index));
            }
            for host in &hosts {
                if let Some(first) = seen.insert(host.clone(), index) {
                    return Err(ConfigError::OverlappingGroups {
                        host: host.clone(),
                        first,
                        second: index,
                    });
                }
            }
            groups.push(hosts);
        }

        Ok(Self {
            groups,
            count: non_zero,
        })
    }

    pub fn count(&self) -> NonZeroUsize {
        self.count
    }

    pub fn hosts(&self, bucket: usize) -> Option<&[String]> {
        self.groups.get(bucket).map(Vec::as_slice)
    }

    /// The bucket a queue belongs to. Never depends on cluster state.
    pub fn bucket_for(&self, vhost: &str, queue: &str) -> usize {
        bucket(&queue_key(vhost, queue), self.count())
    }

    /// Groups in ascending bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[String])> {
        self.groups
            .iter()
            .enumerate()
            .map(|(index, hosts)| (index, hosts.as_slice()))
    }
}

impl FromStr for PolicyGroups {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(s)
            .map_err(|error| ConfigError::InvalidPolicyGroupsJson(error.to_string()))?;

        PolicyGroups::new(raw)
    }
}
