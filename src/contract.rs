//! Data-contract metadata.
//!
//! Downstream consumers rely structurally on the serialized shape of the
//! types in the contract files; they pin the hash below and refuse to run
//! against an incompatible schema. Any edit to a contract file changes the
//! hash, and the test in this module fails the build until the constant is
//! updated deliberately.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bumped when the schema of the contract types changes incompatibly.
pub const DATA_CONTRACT_VERSION: &str = "v1.0.0";

/// Files that define the data contract, relative to the crate root. These
/// contain only the wire-stable model types, not API surfaces.
pub const DATA_CONTRACT_FILES: &[&str] = &["src/types.rs"];

/// SHA-256 over the contents of [`DATA_CONTRACT_FILES`], in order, with a
/// newline separator after each file. Format: `"sha256:<hex>"`.
pub const DATA_CONTRACT_HASH: &str =
    "sha256:9e21d87a627338990d4627d5ab7750981b2bbeb8aa6219b9cd36c9ade720bf0b";

/// Public contract metadata for compatibility validation by callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataContractInfo {
    pub version: String,
    pub hash: String,
    pub files: Vec<String>,
}

pub fn data_contract_info() -> DataContractInfo {
    DataContractInfo {
        version: DATA_CONTRACT_VERSION.to_string(),
        hash: DATA_CONTRACT_HASH.to_string(),
        files: DATA_CONTRACT_FILES.iter().map(|s| s.to_string()).collect(),
    }
}

/// Recomputes the hash from the contract files on disk. Intended for tests
/// and development tooling run inside a source checkout; the source tree is
/// not available to production binaries.
pub fn compute_data_contract_hash() -> Result<String> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut hasher = Sha256::new();

    for rel in DATA_CONTRACT_FILES {
        let path = root.join(rel);
        let data = std::fs::read(&path)
            .with_context(|| format!("read data contract file {}", path.display()))?;
        hasher.update(&data);
        // Separator for determinism.
        hasher.update(b"\n");
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Compares the recomputed hash against [`DATA_CONTRACT_HASH`].
pub fn validate_data_contract() -> Result<()> {
    let computed = compute_data_contract_hash()?;
    if computed != DATA_CONTRACT_HASH {
        anyhow::bail!(
            "data contract hash mismatch: compiled={DATA_CONTRACT_HASH}, computed={computed}. \
             If this change is intentional, update DATA_CONTRACT_HASH in contract.rs and bump \
             DATA_CONTRACT_VERSION"
        );
    }
    Ok(())
}
