//! Registry record types: detections, identities, seasonal traits, incidents.

use crate::constants::HOURS_PER_DAY;
use crate::embedding::Embedding;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Stable identifier of an individual animal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub u64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ind-{:05}", self.0)
    }
}

impl std::str::FromStr for IdentityId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("ind-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("invalid identity id '{s}'"))
    }
}

/// Identifier of a detection, assigned upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionId(pub u64);

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DetectionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| format!("invalid detection id '{s}'"))
    }
}

/// Sex label from the upstream classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    /// Male.
    Male,
    /// Female.
    Female,
    /// Not determined.
    #[default]
    Unknown,
}

impl Sex {
    /// Whether two sex labels may describe the same individual.
    pub fn compatible_with(self, other: Self) -> bool {
        self == Self::Unknown || other == Self::Unknown || self == other
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "male"),
            Self::Female => write!(f, "female"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Age class from the upstream classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeClass {
    /// Juvenile.
    Juvenile,
    /// Subadult.
    Subadult,
    /// Adult.
    Adult,
    /// Not determined.
    #[default]
    Unknown,
}

impl fmt::Display for AgeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Juvenile => write!(f, "juvenile"),
            Self::Subadult => write!(f, "subadult"),
            Self::Adult => write!(f, "adult"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Coarse category label: species, sex and age.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Category {
    /// Species label.
    pub species: String,
    /// Sex label.
    #[serde(default)]
    pub sex: Sex,
    /// Age class.
    #[serde(default)]
    pub age: AgeClass,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.species, self.sex, self.age)
    }
}

/// Axis-aligned bounding box in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

impl BoundingBox {
    /// Box area; degenerate boxes have zero area.
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Self) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

/// Processing state of a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionState {
    /// Received, not yet deduplicated.
    #[default]
    Pending,
    /// Survived deduplication, waiting for embeddings.
    Deduplicated,
    /// Marked as a duplicate of another detection. Terminal.
    Duplicate,
    /// Embeddings extracted, waiting for a decision.
    Embedded,
    /// Assigned to an existing identity.
    Matched,
    /// Seeded a new identity.
    NewIdentity,
    /// Needs a human decision.
    Unresolved,
}

impl DetectionState {
    /// Whether the state is a final decision for this run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Duplicate | Self::Matched | Self::NewIdentity | Self::Unresolved
        )
    }
}

impl fmt::Display for DetectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deduplicated => "deduplicated",
            Self::Duplicate => "duplicate",
            Self::Embedded => "embedded",
            Self::Matched => "matched",
            Self::NewIdentity => "new-identity",
            Self::Unresolved => "unresolved",
        };
        write!(f, "{s}")
    }
}

/// How a detection got its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMethod {
    /// Fused score cleared the threshold.
    Matched,
    /// The detection seeded the identity.
    Created,
    /// A reviewer assigned it.
    Manual,
}

impl fmt::Display for AssignmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Created => write!(f, "created"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Identity assignment of a detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Assigned identity.
    pub identity: IdentityId,
    /// How the assignment was made.
    pub method: AssignmentMethod,
    /// Fused score behind the assignment, when one was computed.
    pub score: Option<f32>,
}

/// Reasons a detection is shown to reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewFlag {
    /// Two or more candidates scored within the tie epsilon.
    Ambiguous,
    /// Category gating left no candidates and auto-create is off.
    NoCandidates,
    /// No extractor produced an embedding usable for this decision.
    NoEmbedding,
    /// Upstream detector confidence was below the review floor.
    LowConfidence,
}

impl fmt::Display for ReviewFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ambiguous => "ambiguous",
            Self::NoCandidates => "no-candidates",
            Self::NoEmbedding => "no-embedding",
            Self::LowConfidence => "low-confidence",
        };
        write!(f, "{s}")
    }
}

/// One candidate score kept on a detection for reviewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    /// Candidate identity.
    pub identity: IdentityId,
    /// Fused score.
    pub score: f32,
    /// Prior sightings of the candidate at decision time.
    pub sightings: u64,
    /// Per-extractor clamped similarity.
    pub breakdown: BTreeMap<String, f32>,
}

/// A detection handed over by the upstream detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Upstream id.
    pub id: DetectionId,
    /// Source image.
    pub image: PathBuf,
    /// Cropped detection image.
    pub crop: PathBuf,
    /// Box in the source image.
    pub bbox: BoundingBox,
    /// Category label.
    pub category: Category,
    /// Detector confidence.
    pub confidence: f32,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Camera identifier.
    pub camera: String,
    /// Pose / viewpoint label, when upstream provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewpoint: Option<String>,
    /// Embeddings, at most one per extractor.
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
    /// Processing state.
    #[serde(default)]
    pub state: DetectionState,
    /// Identity assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
    /// Review flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review: Vec<ReviewFlag>,
    /// Top candidate scores behind the last decision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateScore>,
    /// Detection this one duplicates (spatial) or continues (temporal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_to: Option<DetectionId>,
    /// Identities this detection must never be assigned to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<IdentityId>,
    /// Last processing error, kept while the detection stays pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Processing attempts made so far.
    #[serde(default)]
    pub attempts: u32,
}

impl Detection {
    /// The embedding produced by the given extractor version, if any.
    pub fn embedding(&self, extractor: &str, version: &str) -> Option<&Embedding> {
        self.embeddings.iter().find(|e| e.is_from(extractor, version))
    }

    /// Add a review flag once.
    pub fn flag(&mut self, flag: ReviewFlag) {
        if !self.review.contains(&flag) {
            self.review.push(flag);
            self.review.sort();
        }
    }

    /// Assigned identity, if any.
    pub fn identity(&self) -> Option<IdentityId> {
        self.assignment.as_ref().map(|a| a.identity)
    }

    /// Whether reviewers should see this detection.
    pub fn needs_review(&self) -> bool {
        self.state == DetectionState::Unresolved || !self.review.is_empty()
    }

    /// Reset decision fields before (re)matching.
    pub fn clear_decision(&mut self) {
        self.assignment = None;
        self.review.clear();
        self.candidates.clear();
        self.last_error = None;
    }
}

/// A running representative vector for one extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmbedding {
    /// Extractor version the vector belongs to.
    pub version: String,
    /// L2-normalized representative vector.
    pub vector: Vec<f32>,
    /// Samples folded into the vector.
    pub samples: u64,
}

/// Where and when an identity is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    /// Sightings per camera.
    pub locations: BTreeMap<String, u64>,
    /// Sightings per UTC hour of day.
    pub hours: [u64; HOURS_PER_DAY],
}

impl Default for ActivitySummary {
    fn default() -> Self {
        Self {
            locations: BTreeMap::new(),
            hours: [0; HOURS_PER_DAY],
        }
    }
}

impl ActivitySummary {
    /// Record one sighting.
    pub fn record(&mut self, camera: &str, at: DateTime<Utc>) {
        *self.locations.entry(camera.to_string()).or_default() += 1;
        self.hours[at.hour() as usize % HOURS_PER_DAY] += 1;
    }

    /// Remove one sighting, saturating at zero.
    pub fn forget(&mut self, camera: &str, at: DateTime<Utc>) {
        if let Some(count) = self.locations.get_mut(camera) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.locations.remove(camera);
            }
        }
        let hour = &mut self.hours[at.hour() as usize % HOURS_PER_DAY];
        *hour = hour.saturating_sub(1);
    }

    /// Fold another summary into this one.
    pub fn absorb(&mut self, other: &Self) {
        for (camera, count) in &other.locations {
            *self.locations.entry(camera.clone()).or_default() += count;
        }
        for (hour, count) in self.hours.iter_mut().zip(other.hours) {
            *hour += count;
        }
    }

    /// Camera with the most sightings; ties go to the lexically first.
    pub fn top_location(&self) -> Option<&str> {
        self.locations
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(camera, _)| camera.as_str())
    }

    /// Hour of day with the most sightings.
    pub fn peak_hour(&self) -> Option<usize> {
        let (hour, count) = self
            .hours
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(&a.0)))?;
        (*count > 0).then_some(hour)
    }
}

/// Best detection of an identity for one viewpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Exemplar detection.
    pub detection: DetectionId,
    /// Its detector confidence.
    pub confidence: f32,
}

/// Profile of one individual animal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable id.
    pub id: IdentityId,
    /// Optional name given by a reviewer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Category.
    pub category: Category,
    /// Running representative vector per extractor.
    pub embeddings: BTreeMap<String, StoredEmbedding>,
    /// First sighting.
    pub first_seen: DateTime<Utc>,
    /// Last sighting.
    pub last_seen: DateTime<Utc>,
    /// Number of detections assigned.
    pub sightings: u64,
    /// Activity summary.
    #[serde(default)]
    pub activity: ActivitySummary,
    /// Best exemplar per viewpoint.
    #[serde(default)]
    pub exemplars: BTreeMap<String, Exemplar>,
    /// Identities merged into this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<IdentityId>,
    /// Excluded from matching until repaired.
    #[serde(default)]
    pub quarantined: bool,
}

/// Viewpoint key used when upstream gives none.
pub const ANY_VIEWPOINT: &str = "any";

impl Identity {
    /// Seed a new identity from a detection.
    pub fn seed(id: IdentityId, detection: &Detection) -> Self {
        let embeddings = detection
            .embeddings
            .iter()
            .map(|e| {
                (
                    e.extractor.clone(),
                    StoredEmbedding {
                        version: e.version.clone(),
                        vector: e.vector.clone(),
                        samples: 1,
                    },
                )
            })
            .collect();

        let mut identity = Self {
            id,
            name: None,
            category: detection.category.clone(),
            embeddings,
            first_seen: detection.timestamp,
            last_seen: detection.timestamp,
            sightings: 1,
            activity: ActivitySummary::default(),
            exemplars: BTreeMap::new(),
            merged_from: Vec::new(),
            quarantined: false,
        };
        identity.activity.record(&detection.camera, detection.timestamp);
        identity.offer_exemplar(detection);
        identity
    }

    /// Display label: name if set, otherwise the id.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// Stored vector for an extractor version.
    pub fn vector(&self, extractor: &str, version: &str) -> Option<&[f32]> {
        self.embeddings
            .get(extractor)
            .filter(|e| e.version == version)
            .map(|e| e.vector.as_slice())
    }

    /// Keep the detection as exemplar for its viewpoint if it beats the current one.
    pub fn offer_exemplar(&mut self, detection: &Detection) {
        let key = detection
            .viewpoint
            .clone()
            .unwrap_or_else(|| ANY_VIEWPOINT.to_string());
        let better = self.exemplars.get(&key).is_none_or(|current| {
            detection.confidence > current.confidence
                || (detection.confidence == current.confidence
                    && detection.id < current.detection)
        });
        if better {
            self.exemplars.insert(
                key,
                Exemplar {
                    detection: detection.id,
                    confidence: detection.confidence,
                },
            );
        }
    }

    /// Extend the observed time span.
    pub fn extend_span(&mut self, at: DateTime<Utc>) {
        self.first_seen = self.first_seen.min(at);
        self.last_seen = self.last_seen.max(at);
    }
}

/// Season-specific trait record of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalTrait {
    /// Identity the trait belongs to.
    pub identity: IdentityId,
    /// Season tag, e.g. `2024-late`.
    pub season: String,
    /// Extractor that describes the trait.
    pub extractor: String,
    /// Extractor version.
    pub version: String,
    /// Running trait vector.
    pub vector: Vec<f32>,
    /// Best detection for the season.
    pub representative: DetectionId,
    /// Confidence of the representative detection.
    pub representative_confidence: f32,
    /// First sighting in the season.
    pub first_seen: DateTime<Utc>,
    /// Last sighting in the season.
    pub last_seen: DateTime<Utc>,
    /// Sightings in the season.
    pub sightings: u64,
}

/// Operator-visible data-integrity incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Sequential id.
    pub id: u64,
    /// Affected identity.
    pub identity: IdentityId,
    /// Detection being processed when the violation surfaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionId>,
    /// What is wrong.
    pub message: String,
    /// When it was raised.
    pub raised_at: DateTime<Utc>,
    /// Whether an operator released the identity.
    #[serde(default)]
    pub resolved: bool,
}
