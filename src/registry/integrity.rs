//! Data-integrity checks and operator quarantine.
//!
//! An identity that violates a registry invariant is quarantined: it leaves
//! the similarity index and an [`Incident`] is recorded for operators. It
//! returns to matching only through `release` after repair, or by being
//! merged into a healthy identity.

use crate::error::{Error, Result};
use crate::registry::{
    DetectionId, Identity, IdentityId, Incident, Mutation, Registry, RegistryState,
};
use chrono::Utc;
use tracing::{error, info};

/// Check one identity against the registry invariants.
pub fn check(identity: &Identity, primary: &str) -> Result<()> {
    let mut problems = Vec::new();

    if identity.embeddings.is_empty() {
        problems.push("no embeddings".to_string());
    } else if !identity.embeddings.contains_key(primary) {
        problems.push(format!("missing primary embedding '{primary}'"));
    }
    for (name, stored) in &identity.embeddings {
        if stored.vector.is_empty() || stored.vector.iter().any(|x| !x.is_finite()) {
            problems.push(format!("embedding '{name}' is empty or non-finite"));
        } else if stored.vector.iter().all(|x| x.abs() < f32::MIN_POSITIVE) {
            problems.push(format!("embedding '{name}' is a zero vector"));
        }
    }
    if identity.sightings == 0 {
        problems.push("zero sightings".to_string());
    }
    if identity.first_seen > identity.last_seen {
        problems.push("first sighting after last sighting".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Integrity {
            identity: identity.id,
            message: problems.join("; "),
        })
    }
}

/// Mutations quarantining an identity and recording an incident.
pub fn quarantine(
    identity: &Identity,
    incident_id: u64,
    detection: Option<DetectionId>,
    message: &str,
) -> Vec<Mutation> {
    let mut quarantined = identity.clone();
    quarantined.quarantined = true;

    vec![
        Mutation::identity(quarantined),
        Mutation::RecordIncident {
            incident: Incident {
                id: incident_id,
                identity: identity.id,
                detection,
                message: message.to_string(),
                raised_at: Utc::now(),
                resolved: false,
            },
        },
    ]
}

/// Log a freshly raised incident for operators.
pub fn report(incident: &Incident) {
    error!(
        "Integrity incident #{}: identity {} quarantined: {}",
        incident.id, incident.identity, incident.message
    );
}

/// Check every active identity and quarantine the ones in violation.
///
/// Returns the incidents raised.
pub fn sweep(registry: &Registry, primary: &str) -> Result<Vec<Incident>> {
    let raised = registry.commit(|state| {
        let mut next_id = state.next_incident_id();
        let mut mutations = Vec::new();
        let mut raised = Vec::new();

        for identity in state.identities.values().filter(|i| !i.quarantined) {
            if let Err(e) = check(identity, primary) {
                let message = violation_message(&e);
                for m in quarantine(identity, next_id, None, &message) {
                    if let Mutation::RecordIncident { incident } = &m {
                        raised.push(incident.clone());
                    }
                    mutations.push(m);
                }
                next_id += 1;
            }
        }
        Ok((mutations, raised))
    })?;

    raised.iter().for_each(report);
    Ok(raised)
}

/// Return a repaired identity to matching and resolve its incidents.
pub fn release(registry: &Registry, id: IdentityId, primary: &str) -> Result<Identity> {
    let released = registry.commit(|state| {
        let identity = state
            .identities
            .get(&id)
            .ok_or(Error::IdentityNotFound { id })?;
        if !identity.quarantined {
            return Err(Error::InvalidCorrection {
                message: format!("identity {id} is not quarantined"),
            });
        }
        check(identity, primary).map_err(|e| Error::InvalidCorrection {
            message: format!("identity {id} still violates: {}", violation_message(&e)),
        })?;

        let mut released = identity.clone();
        released.quarantined = false;

        let mut mutations = vec![Mutation::identity(released.clone())];
        mutations.extend(resolve_incidents(state, id));
        Ok((mutations, released))
    })?;

    info!("Released identity {id}");
    Ok(released)
}

/// Mutations resolving every open incident of an identity.
pub fn resolve_incidents(state: &RegistryState, id: IdentityId) -> Vec<Mutation> {
    state
        .open_incidents()
        .filter(|i| i.identity == id)
        .map(|i| Mutation::RecordIncident {
            incident: Incident {
                resolved: true,
                ..i.clone()
            },
        })
        .collect()
}

/// Violation text without the error prefix.
pub fn violation_message(err: &Error) -> String {
    match err {
        Error::Integrity { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::registry::{ActivitySummary, AgeClass, Category, Sex, StoredEmbedding};
    use std::collections::BTreeMap;

    fn identity(id: u64) -> Identity {
        let now = Utc::now();
        let mut embeddings = BTreeMap::new();
        embeddings.insert(
            "body".to_string(),
            StoredEmbedding {
                version: "v1".to_string(),
                vector: vec![0.6, 0.8],
                samples: 1,
            },
        );
        Identity {
            id: IdentityId(id),
            name: None,
            category: Category {
                species: "lynx".to_string(),
                sex: Sex::Unknown,
                age: AgeClass::Adult,
            },
            embeddings,
            first_seen: now,
            last_seen: now,
            sightings: 1,
            activity: ActivitySummary::default(),
            exemplars: BTreeMap::new(),
            merged_from: Vec::new(),
            quarantined: false,
        }
    }

    #[test]
    fn test_healthy_identity_passes() {
        assert!(check(&identity(1), "body").is_ok());
    }

    #[test]
    fn test_violations_are_reported() {
        let mut bad = identity(1);
        bad.embeddings.clear();
        let err = check(&bad, "body").unwrap_err();
        assert!(violation_message(&err).contains("no embeddings"));

        let mut bad = identity(2);
        bad.sightings = 0;
        bad.embeddings.get_mut("body").unwrap().vector = vec![f32::NAN, 1.0];
        let message = violation_message(&check(&bad, "body").unwrap_err());
        assert!(message.contains("non-finite"));
        assert!(message.contains("zero sightings"));

        assert!(check(&identity(3), "head").is_err());
    }

    #[test]
    fn test_sweep_quarantines_and_release_requires_repair() {
        let registry = Registry::in_memory();
        let mut broken = identity(2);
        broken.embeddings.clear();
        registry
            .commit(|_| {
                Ok((
                    vec![Mutation::identity(identity(1)), Mutation::identity(broken)],
                    (),
                ))
            })
            .unwrap();

        let incidents = sweep(&registry, "body").unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].identity, IdentityId(2));
        assert!(registry.identity(IdentityId(2)).unwrap().quarantined);
        assert_eq!(registry.read(|s| s.index.len("body")).unwrap(), 1);

        // A second sweep does not raise duplicates.
        assert!(sweep(&registry, "body").unwrap().is_empty());

        let err = release(&registry, IdentityId(2), "body").unwrap_err();
        assert!(matches!(err, Error::InvalidCorrection { .. }));

        let mut repaired = registry.identity(IdentityId(2)).unwrap();
        repaired.embeddings = identity(2).embeddings;
        registry
            .commit(|_| Ok((vec![Mutation::identity(repaired)], ())))
            .unwrap();
        let released = release(&registry, IdentityId(2), "body").unwrap();
        assert!(!released.quarantined);
        assert_eq!(registry.read(|s| s.open_incidents().count()).unwrap(), 0);
        assert_eq!(registry.read(|s| s.index.len("body")).unwrap(), 2);
    }

    #[test]
    fn test_release_healthy_identity_is_rejected() {
        let registry = Registry::in_memory();
        registry
            .commit(|_| Ok((vec![Mutation::identity(identity(1))], ())))
            .unwrap();
        assert!(release(&registry, IdentityId(1), "body").is_err());
    }
}
