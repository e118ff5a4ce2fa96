//! In-memory registry state and the mutations that change it.

use crate::constants::registry::SCHEMA_VERSION;
use crate::registry::{
    Detection, DetectionId, Identity, IdentityId, Incident, SeasonalTrait, VectorIndex,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One atomic change to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Insert or replace a detection.
    UpsertDetection {
        /// New record.
        detection: Box<Detection>,
    },
    /// Insert or replace an identity.
    UpsertIdentity {
        /// New record.
        identity: Box<Identity>,
    },
    /// Remove an identity (merge source).
    RemoveIdentity {
        /// Removed identity.
        id: IdentityId,
    },
    /// Insert or replace a seasonal trait row.
    UpsertSeasonal {
        /// New record.
        record: Box<SeasonalTrait>,
    },
    /// Remove a seasonal trait row (merge source).
    RemoveSeasonal {
        /// Owning identity.
        identity: IdentityId,
        /// Season tag.
        season: String,
    },
    /// Insert or replace an incident.
    RecordIncident {
        /// New record.
        incident: Incident,
    },
}

impl Mutation {
    /// Upsert a detection.
    pub fn detection(detection: Detection) -> Self {
        Self::UpsertDetection {
            detection: Box::new(detection),
        }
    }

    /// Upsert an identity.
    pub fn identity(identity: Identity) -> Self {
        Self::UpsertIdentity {
            identity: Box::new(identity),
        }
    }

    /// Upsert a seasonal trait row.
    pub fn seasonal(record: SeasonalTrait) -> Self {
        Self::UpsertSeasonal {
            record: Box::new(record),
        }
    }
}

/// An ordered list of mutations applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Commit time.
    pub at: DateTime<Utc>,
    /// Mutations in application order.
    pub mutations: Vec<Mutation>,
}

/// Full persisted registry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot schema version.
    pub schema_version: String,
    /// Last commit folded into the snapshot.
    pub seq: u64,
    /// Next identity id to hand out.
    pub next_identity: u64,
    /// Next incident id to hand out.
    pub next_incident: u64,
    /// All identities.
    pub identities: Vec<Identity>,
    /// All detections.
    pub detections: Vec<Detection>,
    /// All seasonal trait rows.
    pub seasonal: Vec<SeasonalTrait>,
    /// All incidents.
    pub incidents: Vec<Incident>,
}

/// Registry contents held in memory.
#[derive(Debug, Clone)]
pub struct RegistryState {
    /// Identities by id.
    pub identities: BTreeMap<IdentityId, Identity>,
    /// Detections by id.
    pub detections: BTreeMap<DetectionId, Detection>,
    /// Seasonal rows keyed by (identity, season tag).
    pub seasonal: BTreeMap<(IdentityId, String), SeasonalTrait>,
    /// Incidents by id.
    pub incidents: BTreeMap<u64, Incident>,
    /// Similarity index over non-quarantined identities.
    pub index: VectorIndex,
    /// Last applied commit.
    pub seq: u64,
    next_identity: u64,
    next_incident: u64,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            identities: BTreeMap::new(),
            detections: BTreeMap::new(),
            seasonal: BTreeMap::new(),
            incidents: BTreeMap::new(),
            index: VectorIndex::new(),
            seq: 0,
            next_identity: 1,
            next_incident: 1,
        }
    }
}

impl RegistryState {
    /// Rebuild state from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = Self {
            seq: snapshot.seq,
            next_identity: snapshot.next_identity.max(1),
            next_incident: snapshot.next_incident.max(1),
            ..Self::default()
        };
        for identity in snapshot.identities {
            state.index.upsert(&identity);
            state.identities.insert(identity.id, identity);
        }
        for detection in snapshot.detections {
            state.detections.insert(detection.id, detection);
        }
        for record in snapshot.seasonal {
            state
                .seasonal
                .insert((record.identity, record.season.clone()), record);
        }
        for incident in snapshot.incidents {
            state.incidents.insert(incident.id, incident);
        }
        state
    }

    /// Capture the state as a snapshot.
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            schema_version: SCHEMA_VERSION.to_string(),
            seq: self.seq,
            next_identity: self.next_identity,
            next_incident: self.next_incident,
            identities: self.identities.values().cloned().collect(),
            detections: self.detections.values().cloned().collect(),
            seasonal: self.seasonal.values().cloned().collect(),
            incidents: self.incidents.values().cloned().collect(),
        }
    }

    /// Id the next created identity will get.
    pub fn next_identity_id(&self) -> IdentityId {
        IdentityId(self.next_identity)
    }

    /// Id the next incident will get.
    pub fn next_incident_id(&self) -> u64 {
        self.next_incident
    }

    /// Apply every mutation of a commit in order.
    pub fn apply_commit(&mut self, commit: Commit) {
        for mutation in commit.mutations {
            self.apply(mutation);
        }
        self.seq = self.seq.max(commit.seq);
    }

    /// Apply a single mutation.
    pub fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::UpsertDetection { detection } => {
                self.detections.insert(detection.id, *detection);
            }
            Mutation::UpsertIdentity { identity } => {
                self.next_identity = self.next_identity.max(identity.id.0 + 1);
                self.index.upsert(&identity);
                self.identities.insert(identity.id, *identity);
            }
            Mutation::RemoveIdentity { id } => {
                self.index.remove(id);
                self.identities.remove(&id);
            }
            Mutation::UpsertSeasonal { record } => {
                self.seasonal
                    .insert((record.identity, record.season.clone()), *record);
            }
            Mutation::RemoveSeasonal { identity, season } => {
                self.seasonal.remove(&(identity, season));
            }
            Mutation::RecordIncident { incident } => {
                self.next_incident = self.next_incident.max(incident.id + 1);
                self.incidents.insert(incident.id, incident);
            }
        }
    }

    /// Detections assigned to an identity, in id order.
    pub fn detections_of(&self, identity: IdentityId) -> impl Iterator<Item = &Detection> {
        self.detections
            .values()
            .filter(move |d| d.identity() == Some(identity))
    }

    /// Seasonal rows of an identity, in season-tag order.
    pub fn seasonal_of(&self, identity: IdentityId) -> impl Iterator<Item = &SeasonalTrait> {
        self.seasonal
            .range((identity, String::new())..)
            .take_while(move |((id, _), _)| *id == identity)
            .map(|(_, record)| record)
    }

    /// Open incidents, oldest first.
    pub fn open_incidents(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.values().filter(|i| !i.resolved)
    }
}
