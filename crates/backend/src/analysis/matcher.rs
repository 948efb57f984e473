use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::metadata::{self, MetadataHash};
use crate::artifact::{contract::ContractRecord, ArtifactIndex};

/// Identifies which compiled contract produced a piece of on-chain code.
#[derive(Clone, Debug, Default)]
pub struct BytecodeMatcher {
    by_hash: FxHashMap<MetadataHash, Arc<ContractRecord>>,
    creation_templates: Vec<Arc<ContractRecord>>,
    deployed_templates: Vec<Arc<ContractRecord>>,
}

impl BytecodeMatcher {
    /// Indexes every contract of `index`, keeping artifact load order.
    pub fn new(index: &ArtifactIndex) -> Self {
        let mut matcher = Self::default();
        for record in index.contracts() {
            for code in [&record.deployed, &record.creation].into_iter().flatten() {
                if let Some(hash) = &code.fingerprint {
                    // The first artifact that claims a hash keeps it.
                    matcher.by_hash.entry(hash.clone()).or_insert_with(|| Arc::clone(record));
                }
            }
            if record.creation.is_some() {
                matcher.creation_templates.push(Arc::clone(record));
            }
            if record.deployed.is_some() {
                matcher.deployed_templates.push(Arc::clone(record));
            }
        }

        debug!(
            hashes = matcher.by_hash.len(),
            creation = matcher.creation_templates.len(),
            deployed = matcher.deployed_templates.len(),
            "built bytecode matcher"
        );
        matcher
    }

    /// Finds the contract whose creation (`is_creation`) or deployed code is `code`.
    ///
    /// The embedded metadata hash is tried first. Without one, templates are compared byte
    /// by byte outside link and immutable references: deployed code must have the exact
    /// length, creation code may carry appended constructor arguments.
    pub fn match_code(&self, code: &[u8], is_creation: bool) -> Option<Arc<ContractRecord>> {
        if code.is_empty() {
            return None;
        }

        if let Some(hash) = metadata::fingerprint(code, is_creation) {
            if let Some(record) = self.by_hash.get(&hash) {
                trace!(contract = %record, %hash, "matched by metadata hash");
                return Some(Arc::clone(record));
            }
        }

        let templates =
            if is_creation { &self.creation_templates } else { &self.deployed_templates };
        let found = templates.iter().find(|record| {
            record.bytecode(is_creation).is_some_and(|info| {
                if is_creation {
                    info.template.matches_prefix(code)
                } else {
                    info.template.matches(code)
                }
            })
        });

        match found {
            Some(record) => {
                trace!(contract = %record, "matched by bytecode template");
                Some(Arc::clone(record))
            }
            None => {
                trace!(len = code.len(), is_creation, "no artifact matches the code");
                None
            }
        }
    }
}
