//! The pure "compute derivation roots" collaborator WorkSubmission's
//! first step calls. Deterministic hashing over the ordered evidence
//! sequence; no adapter dependency, so it is unit-testable without mocks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidencePackage {
    pub agent: String,
    pub weight: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivationRoots {
    pub thread_root: String,
    pub evidence_root: String,
    pub agent_weights: std::collections::BTreeMap<String, u32>,
}

/// Stable over the ordered evidence sequence: re-running with the same
/// input always yields the same roots, so this step is never irreversible
/// and safely repeatable on retry.
pub fn compute_derivation_roots(evidence: &[EvidencePackage]) -> DerivationRoots {
    let mut thread_hasher = Sha256::new();
    let mut evidence_hasher = Sha256::new();
    let mut agent_weights = std::collections::BTreeMap::new();

    for package in evidence {
        thread_hasher.update(package.agent.as_bytes());
        thread_hasher.update(package.weight.to_be_bytes());
        evidence_hasher.update(&package.bytes);
        *agent_weights.entry(package.agent.clone()).or_insert(0) += package.weight;
    }

    DerivationRoots {
        thread_root: hex::encode(thread_hasher.finalize()),
        evidence_root: hex::encode(evidence_hasher.finalize()),
        agent_weights,
    }
}
