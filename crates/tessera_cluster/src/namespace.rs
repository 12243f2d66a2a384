//! Partition spaces and their routing strategies.
//!
//! Namespaces are a closed set: each owns its partition count and its
//! key-to-partition mapping, selected once at configuration time. Routers
//! consult the descriptor for partition-key computation, candidate pruning,
//! and the default merge contract.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// The fixed set of partition spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    Graph,
    Table,
    TimeSeries,
    Object,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Graph,
        Namespace::Table,
        Namespace::TimeSeries,
        Namespace::Object,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Graph => "graph",
            Namespace::Table => "table",
            Namespace::TimeSeries => "time_series",
            Namespace::Object => "object",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How merged partials are ordered for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeContract {
    /// Concatenate partials in partition order; apply global limit/offset.
    Unordered,
    /// K-way merge across key-sorted partials.
    OrderedByKey { descending: bool },
}

/// Pruning metadata attached to a read by the query layer.
///
/// Hash-partitioned namespaces can only prune when concrete routing keys are
/// known; range or time predicates over hashed keys fan out to all
/// partitions.
#[derive(Clone, Debug)]
pub enum Pruning {
    /// No metadata: every partition is a candidate.
    All,
    /// Exact routing keys (point lookups, series ids, content addresses).
    Keys(Vec<Vec<u8>>),
}

/// Immutable descriptor for one namespace's partition space.
///
/// `mapping_version` changes only through explicit, versioned
/// reconfiguration; readers carrying an older version re-resolve before
/// routing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDesc {
    pub namespace: Namespace,
    pub partitions: u32,
    pub mapping_version: u32,
}

impl NamespaceDesc {
    pub fn new(namespace: Namespace, partitions: u32) -> Self {
        Self {
            namespace,
            partitions: partitions.max(1),
            mapping_version: 1,
        }
    }

    /// Map a routing key to its partition index.
    ///
    /// Each namespace hashes with its own seed so identical byte keys in
    /// different namespaces do not correlate onto the same partitions.
    pub fn compute_partition(&self, routing_key: &[u8]) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.namespace.as_str().hash(&mut hasher);
        routing_key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partitions)) as u32
    }

    /// Candidate partitions for a read, given pruning metadata.
    pub fn prune_candidates(&self, pruning: &Pruning) -> Vec<u32> {
        match pruning {
            Pruning::All => (0..self.partitions).collect(),
            Pruning::Keys(keys) => {
                let set: BTreeSet<u32> = keys
                    .iter()
                    .map(|key| self.compute_partition(key))
                    .collect();
                set.into_iter().collect()
            }
        }
    }

    /// Default merge contract for this namespace's result batches.
    pub fn merge_contract(&self) -> MergeContract {
        match self.namespace {
            // Graph traversals and object fetches carry no global order.
            Namespace::Graph | Namespace::Object => MergeContract::Unordered,
            // Table scans and series reads come back key/time sorted per
            // partition and merge ordered.
            Namespace::Table | Namespace::TimeSeries => {
                MergeContract::OrderedByKey { descending: false }
            }
        }
    }
}
