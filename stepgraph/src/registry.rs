//! Artifact type registry.
//!
//! Declares which produced artifact kinds satisfy which input requirements.
//! Every kind satisfies itself; the blessing kinds additionally satisfy a
//! generic `validation_result` requirement.

use crate::core::ArtifactKind;
use std::collections::{BTreeMap, BTreeSet};

/// Compatibility rules between produced and required artifact kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRegistry {
    /// Required kind -> produced kinds accepted for it.
    accepts: BTreeMap<ArtifactKind, BTreeSet<ArtifactKind>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let mut accepts: BTreeMap<ArtifactKind, BTreeSet<ArtifactKind>> = ArtifactKind::ALL
            .iter()
            .map(|kind| (*kind, BTreeSet::from([*kind])))
            .collect();

        accepts
            .entry(ArtifactKind::ValidationResult)
            .or_default()
            .extend([ArtifactKind::ModelBlessing, ArtifactKind::InfraBlessing]);

        Self { accepts }
    }
}

impl TypeRegistry {
    /// Creates the standard registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally accepts `produced` wherever `required` is declared.
    #[must_use]
    pub fn with_compatibility(mut self, produced: ArtifactKind, required: ArtifactKind) -> Self {
        self.accepts.entry(required).or_default().insert(produced);
        self
    }

    /// Returns true if an artifact of kind `produced` satisfies an input
    /// requiring `required`.
    #[must_use]
    pub fn satisfies(&self, produced: ArtifactKind, required: ArtifactKind) -> bool {
        self.accepts
            .get(&required)
            .is_some_and(|accepted| accepted.contains(&produced))
    }

    /// Returns true if `kind` can drive a gate.
    #[must_use]
    pub fn is_validation_result(&self, kind: ArtifactKind) -> bool {
        self.satisfies(kind, ArtifactKind::ValidationResult)
    }

    /// Returns the produced kinds accepted for `required`.
    #[must_use]
    pub fn accepted_for(&self, required: ArtifactKind) -> Vec<ArtifactKind> {
        self.accepts
            .get(&required)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
