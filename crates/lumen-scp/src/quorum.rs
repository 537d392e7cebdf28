//! Quorum set helpers the driver needs without running the voting algorithm:
//! content hashing, structural sanity, and membership.

use std::collections::HashSet;

use lumen_common::Hash256;
use stellar_xdr::curr::{NodeId, ScpQuorumSet};

/// Deepest nesting of inner sets accepted from the network.
pub const MAXIMUM_QUORUM_NESTING_LEVEL: u32 = 4;

/// Most distinct validators a quorum set may name.
pub const MAXIMUM_QUORUM_NODES: usize = 1000;

/// Content hash of a quorum set, as referenced from statements.
pub fn hash_quorum_set(quorum_set: &ScpQuorumSet) -> Hash256 {
    Hash256::hash_xdr(quorum_set).unwrap_or(Hash256::ZERO)
}

/// Structural check applied to every quorum set received from a peer.
///
/// Each level needs `1 <= threshold <= entries`, nesting is bounded, and no
/// validator may appear twice anywhere in the tree.
pub fn is_quorum_set_sane(quorum_set: &ScpQuorumSet) -> Result<(), String> {
    let mut seen = HashSet::new();
    check_level(quorum_set, 0, &mut seen)?;
    if seen.is_empty() || seen.len() > MAXIMUM_QUORUM_NODES {
        return Err(format!(
            "quorum must name between 1 and {} nodes, found {}",
            MAXIMUM_QUORUM_NODES,
            seen.len()
        ));
    }
    Ok(())
}

fn check_level(
    quorum_set: &ScpQuorumSet,
    depth: u32,
    seen: &mut HashSet<NodeId>,
) -> Result<(), String> {
    if depth > MAXIMUM_QUORUM_NESTING_LEVEL {
        return Err("maximum quorum nesting level exceeded".to_string());
    }
    if quorum_set.threshold < 1 {
        return Err("threshold must be greater than 0".to_string());
    }
    let entries = quorum_set.validators.len() + quorum_set.inner_sets.len();
    if quorum_set.threshold as usize > entries {
        return Err(format!(
            "threshold {} exceeds {} entries",
            quorum_set.threshold, entries
        ));
    }
    for node in quorum_set.validators.iter() {
        if !seen.insert(node.clone()) {
            return Err("duplicate node in quorum set".to_string());
        }
    }
    for inner in quorum_set.inner_sets.iter() {
        check_level(inner, depth + 1, seen)?;
    }
    Ok(())
}

/// Whether `node` appears anywhere in `quorum_set`.
pub fn quorum_set_contains(quorum_set: &ScpQuorumSet, node: &NodeId) -> bool {
    quorum_set.validators.iter().any(|v| v == node)
        || quorum_set
            .inner_sets
            .iter()
            .any(|inner| quorum_set_contains(inner, node))
}

/// Flat quorum set over `validators`.
pub fn simple_quorum_set(threshold: u32, validators: Vec<NodeId>) -> ScpQuorumSet {
    ScpQuorumSet {
        threshold,
        validators: validators.try_into().unwrap_or_default(),
        inner_sets: Default::default(),
    }
}
