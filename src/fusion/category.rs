//! Category gating.

use crate::registry::Category;

/// Whether a detection of `detection` category may belong to an identity of
/// `identity` category.
///
/// Species must match exactly. Sex must match unless either side is
/// unknown. Age is not gated: individuals age across the registry's life.
pub fn compatible(detection: &Category, identity: &Category) -> bool {
    detection.species == identity.species && detection.sex.compatible_with(identity.sex)
}

/// Lock key for the category partition a detection belongs to.
pub fn partition_key(category: &Category) -> &str {
    &category.species
}
