//! End-to-end matching scenarios against an in-memory registry.

#![allow(clippy::unwrap_used, clippy::float_cmp)]

use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wildreid::config::{Config, SeasonalConfig};
use wildreid::dedup;
use wildreid::embedding::{Embedding, ExtractorSet};
use wildreid::fusion::category;
use wildreid::pipeline::{CancelFlag, Orchestrator, Outcome, WorkerPool};
use wildreid::registry::corrections;
use wildreid::registry::profile;
use wildreid::registry::{
    AgeClass, BoundingBox, Category, Detection, DetectionId, DetectionState, IdentityId,
    Mutation, Registry, Sex,
};

fn at(month: u32, secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, 12, 21, 0, secs).unwrap()
}

/// Unit vector at cosine `similarity` from `[1, 0]`.
fn towards(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).sqrt()]
}

fn detection(id: u64, camera: &str, timestamp: DateTime<Utc>) -> Detection {
    Detection {
        id: DetectionId(id),
        image: PathBuf::from(format!("{camera}/frame-{id}.jpg")),
        crop: PathBuf::from(format!("crops/{id}.jpg")),
        bbox: BoundingBox {
            x1: 10.0,
            y1: 10.0,
            x2: 110.0,
            y2: 90.0,
        },
        category: Category {
            species: "lynx".to_string(),
            sex: Sex::Unknown,
            age: AgeClass::Adult,
        },
        confidence: 0.9,
        timestamp,
        camera: camera.to_string(),
        viewpoint: None,
        embeddings: Vec::new(),
        state: DetectionState::Deduplicated,
        assignment: None,
        review: Vec::new(),
        candidates: Vec::new(),
        linked_to: None,
        rejected: Vec::new(),
        last_error: None,
        attempts: 0,
    }
}

fn with(mut detection: Detection, extractor: &str, vector: Vec<f32>) -> Detection {
    detection
        .embeddings
        .push(Embedding::new(extractor, "v1", vector).unwrap());
    detection
}

fn config(threshold: f32) -> Config {
    let mut config = Config::default();
    config.matching.threshold = threshold;
    config.workers.backoff_initial_ms = 1;
    config.workers.backoff_max_ms = 2;
    config
}

fn body_only(registry: &Arc<Registry>, config: &Config) -> Arc<Orchestrator> {
    let extractors = ExtractorSet::new(Duration::from_secs(1)).with_precomputed("body", "v1", 1.0);
    Arc::new(
        Orchestrator::new(Arc::clone(registry), extractors, config, CancelFlag::new()).unwrap(),
    )
}

fn body_and_coat(registry: &Arc<Registry>, config: &Config) -> Arc<Orchestrator> {
    let extractors = ExtractorSet::new(Duration::from_secs(1))
        .with_precomputed("body", "v1", 0.7)
        .with_precomputed("coat", "v1", 0.3);
    Arc::new(
        Orchestrator::new(Arc::clone(registry), extractors, config, CancelFlag::new()).unwrap(),
    )
}

fn insert(registry: &Registry, detections: Vec<Detection>) -> Vec<DetectionId> {
    let ids = detections.iter().map(|d| d.id).collect();
    registry
        .commit(|_| Ok((detections.into_iter().map(Mutation::detection).collect(), ())))
        .unwrap();
    ids
}

/// Registry with one lynx identity seeded from a `[1, 0]` body vector.
async fn seeded(config: &Config) -> (Arc<Registry>, Arc<Orchestrator>) {
    let registry = Arc::new(Registry::in_memory());
    let orch = body_only(&registry, config);
    insert(
        &registry,
        vec![with(detection(1, "ridge", at(3, 0)), "body", vec![1.0, 0.0])],
    );
    let outcome = orch.process(DetectionId(1), None).await;
    assert_eq!(outcome, Outcome::Created { identity: IdentityId(1) });
    (registry, orch)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_sightings_on_two_cameras_join_existing_identity() {
    let config = config(0.70);
    let (registry, orch) = seeded(&config).await;

    let ids = insert(
        &registry,
        vec![
            with(detection(2, "north", at(3, 30)), "body", towards(0.95)),
            with(detection(3, "south", at(3, 30)), "body", towards(0.95)),
        ],
    );
    let summary = WorkerPool::new(orch, 4, config.dedup.clone())
        .run(&ids, None)
        .await
        .unwrap();

    assert_eq!(summary.matched, 2);
    assert_eq!(summary.created, 0);
    for id in ids {
        let stored = registry.detection(id).unwrap();
        assert_eq!(stored.state, DetectionState::Matched);
        assert_eq!(stored.assignment.unwrap().identity, IdentityId(1));
    }
    assert_eq!(registry.identity(IdentityId(1)).unwrap().sightings, 3);
    assert_eq!(registry.read(|s| s.identities.len()).unwrap(), 1);
}

#[tokio::test]
async fn test_weak_best_candidate_seeds_new_identity() {
    let config = config(0.70);
    let (registry, orch) = seeded(&config).await;
    insert(
        &registry,
        vec![with(detection(2, "north", at(3, 40)), "body", towards(0.5))],
    );

    let outcome = orch.process(DetectionId(2), None).await;
    assert_eq!(outcome, Outcome::Created { identity: IdentityId(2) });

    let identity = registry.identity(IdentityId(2)).unwrap();
    assert_eq!(identity.sightings, 1);
    assert_eq!(identity.first_seen, at(3, 40));
    let stored = registry.detection(DetectionId(2)).unwrap();
    assert_eq!(stored.state, DetectionState::NewIdentity);
    assert_eq!(stored.candidates[0].identity, IdentityId(1));
    assert!((stored.candidates[0].score - 0.5).abs() < 1e-4);
}

#[tokio::test]
async fn test_burst_frame_at_same_camera_is_duplicate() {
    let config = config(0.70);
    let registry = Arc::new(Registry::in_memory());
    let orch = body_only(&registry, &config);
    let ids = insert(
        &registry,
        vec![
            with(detection(1, "ridge", at(3, 0)), "body", vec![1.0, 0.0]),
            with(detection(2, "ridge", at(3, 2)), "body", towards(0.99)),
        ],
    );

    let summary = WorkerPool::new(orch, 2, config.dedup.clone())
        .run(&ids, None)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.duplicates, 1);

    let second = registry.detection(DetectionId(2)).unwrap();
    assert_eq!(second.state, DetectionState::Duplicate);
    assert_eq!(second.linked_to, Some(DetectionId(1)));
    assert!(second.assignment.is_none());
    assert_eq!(registry.identity(IdentityId(1)).unwrap().sightings, 1);
}

#[tokio::test]
async fn test_seasonal_trait_is_scoped_to_its_own_season() {
    let mut config = config(0.70);
    config.seasonal = SeasonalConfig {
        extractor: Some("coat".to_string()),
        species: vec!["lynx".to_string()],
        ..SeasonalConfig::default()
    };
    let registry = Arc::new(Registry::in_memory());
    let orch = body_and_coat(&registry, &config);

    let early = with(
        with(detection(1, "ridge", at(3, 0)), "body", vec![1.0, 0.0]),
        "coat",
        vec![1.0, 0.0],
    );
    insert(&registry, vec![early]);
    orch.process(DetectionId(1), None).await;

    let (late, early) = registry
        .read(|s| {
            (
                profile::season(s, IdentityId(1), "2024-late").unwrap(),
                profile::season(s, IdentityId(1), "2024-early").unwrap(),
            )
        })
        .unwrap();
    assert!(late.is_none());
    assert_eq!(early.unwrap().representative, DetectionId(1));

    // Winter coat looks nothing like summer coat; the body still matches.
    let autumn = with(
        with(detection(2, "ridge", at(9, 0)), "body", vec![1.0, 0.0]),
        "coat",
        vec![0.0, 1.0],
    );
    insert(&registry, vec![autumn]);
    let outcome = orch.process(DetectionId(2), None).await;
    match outcome {
        Outcome::Matched {
            identity, score, ..
        } => {
            assert_eq!(identity, IdentityId(1));
            assert!((score - 1.0).abs() < 1e-4);
        }
        other => panic!("expected a match, got {other:?}"),
    }

    let seasons = registry
        .read(|s| profile::identity_profile(s, IdentityId(1)).unwrap().seasons)
        .unwrap();
    let tags: Vec<_> = seasons.iter().map(|s| s.season.as_str()).collect();
    assert_eq!(tags, vec!["2024-early", "2024-late"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sightings_of_new_animal_create_one_identity() {
    let config = config(0.70);
    for round in 0..20u64 {
        let registry = Arc::new(Registry::in_memory());
        let orch = body_only(&registry, &config);
        insert(
            &registry,
            vec![
                with(detection(1, "ridge", at(3, 0)), "body", vec![1.0, 0.0]),
                with(detection(2, "ridge", at(3, 0)), "body", towards(0.97)),
            ],
        );

        let a = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.process(DetectionId(1), None).await }
        });
        let b = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.process(DetectionId(2), None).await }
        });
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let created = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Created { .. }))
            .count();
        let matched = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Matched { .. }))
            .count();
        assert_eq!((created, matched), (1, 1), "round {round}: {outcomes:?}");
        assert_eq!(registry.read(|s| s.identities.len()).unwrap(), 1);
        assert_eq!(registry.identity(IdentityId(1)).unwrap().sightings, 2);
    }
}

#[tokio::test]
async fn test_same_state_gives_same_decision() {
    let config = config(0.70);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let (registry, orch) = seeded(&config).await;
        insert(
            &registry,
            vec![with(detection(2, "north", at(3, 30)), "body", towards(0.83))],
        );
        outcomes.push(orch.process(DetectionId(2), None).await);
    }
    assert!(matches!(outcomes[0], Outcome::Matched { .. }));
    assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_raising_threshold_never_raises_assignment_rate() {
    let similarities = [0.3, 0.55, 0.62, 0.71, 0.78, 0.86, 0.93, 0.99];
    let mut rates = Vec::new();

    for threshold in [0.5, 0.6, 0.7, 0.8, 0.9, 0.95] {
        let config = config(threshold);
        let mut matched = 0;
        for (i, similarity) in similarities.iter().enumerate() {
            let (registry, orch) = seeded(&config).await;
            let id = 10 + i as u64;
            insert(
                &registry,
                vec![with(detection(id, "north", at(4, 0)), "body", towards(*similarity))],
            );
            if matches!(
                orch.process(DetectionId(id), None).await,
                Outcome::Matched { .. }
            ) {
                matched += 1;
            }
        }
        rates.push(matched);
    }

    assert!(rates.windows(2).all(|w| w[0] >= w[1]), "rates: {rates:?}");
    assert!(rates[0] > *rates.last().unwrap());
}

#[tokio::test]
async fn test_assignments_never_cross_categories() {
    let config = config(0.70);
    let registry = Arc::new(Registry::in_memory());
    let orch = body_only(&registry, &config);

    let mut male = with(detection(1, "ridge", at(3, 0)), "body", vec![1.0, 0.0]);
    male.category.sex = Sex::Male;
    let mut female = with(detection(2, "north", at(3, 0)), "body", vec![1.0, 0.0]);
    female.category.sex = Sex::Female;
    let mut wolf = with(detection(3, "south", at(3, 0)), "body", vec![1.0, 0.0]);
    wolf.category.species = "wolf".to_string();
    let unknown = with(detection(4, "east", at(3, 10)), "body", vec![1.0, 0.0]);
    insert(&registry, vec![male, female, wolf, unknown]);

    for id in 1..=4 {
        orch.process(DetectionId(id), None).await;
    }

    let (identities, pairs) = registry
        .read(|s| {
            let pairs: Vec<_> = s
                .detections
                .values()
                .filter_map(|d| {
                    let identity = s.identities.get(&d.assignment.as_ref()?.identity)?;
                    Some((d.category.clone(), identity.category.clone()))
                })
                .collect();
            (s.identities.len(), pairs)
        })
        .unwrap();
    assert_eq!(identities, 3);
    assert_eq!(pairs.len(), 4);
    assert!(pairs.iter().all(|(d, i)| category::compatible(d, i)));
}

#[tokio::test]
async fn test_merge_moves_everything_and_sums_sightings() {
    let mut config = config(0.70);
    config.seasonal = SeasonalConfig {
        extractor: Some("coat".to_string()),
        species: vec!["lynx".to_string()],
        ..SeasonalConfig::default()
    };
    let registry = Arc::new(Registry::in_memory());
    let orch = body_and_coat(&registry, &config);

    let both = |d: Detection, body: Vec<f32>, coat: Vec<f32>| with(with(d, "body", body), "coat", coat);
    insert(
        &registry,
        vec![
            both(detection(1, "ridge", at(3, 0)), vec![1.0, 0.0], vec![1.0, 0.0]),
            both(detection(2, "north", at(3, 50)), towards(0.98), vec![1.0, 0.0]),
            both(detection(3, "south", at(3, 0)), vec![0.0, 1.0], vec![0.0, 1.0]),
            both(detection(4, "south", at(8, 0)), vec![0.05, 1.0], vec![0.0, 1.0]),
        ],
    );
    for id in 1..=4 {
        orch.process(DetectionId(id), None).await;
    }

    let a = IdentityId(1);
    let b = IdentityId(2);
    let before = registry
        .read(|s| s.identities[&a].sightings + s.identities[&b].sightings)
        .unwrap();
    assert_eq!(before, 4);

    let summary = corrections::merge(&registry, b, a).unwrap();
    assert_eq!(summary.moved_detections, 2);
    assert_eq!(summary.target.sightings, before);

    registry
        .read(|s| {
            assert!(!s.identities.contains_key(&b));
            assert_eq!(s.detections_of(b).count(), 0);
            assert_eq!(s.seasonal_of(b).count(), 0);
            assert_eq!(s.detections_of(a).count(), 4);
            assert!(s.identities[&a].merged_from.contains(&b));
        })
        .unwrap();
}

#[tokio::test]
async fn test_missing_extractor_scores_on_remaining_one() {
    let config = config(0.70);
    let registry = Arc::new(Registry::in_memory());
    let orch = body_and_coat(&registry, &config);

    let seed = with(
        with(detection(1, "ridge", at(3, 0)), "body", vec![1.0, 0.0]),
        "coat",
        vec![0.0, 1.0],
    );
    let body_only = with(detection(2, "north", at(3, 40)), "body", towards(0.9));
    insert(&registry, vec![seed, body_only]);

    orch.process(DetectionId(1), None).await;
    match orch.process(DetectionId(2), None).await {
        Outcome::Matched { score, .. } => assert!((score - 0.9).abs() < 1e-4),
        other => panic!("expected a match, got {other:?}"),
    }
    let stored = registry.detection(DetectionId(2)).unwrap();
    let breakdown: Vec<_> = stored.candidates[0]
        .breakdown
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(breakdown, vec!["body"]);
}

#[test]
fn test_spatial_dedup_is_idempotent() {
    let mut a = detection(1, "ridge", at(3, 0));
    a.image = PathBuf::from("ridge/frame.jpg");
    let mut b = a.clone();
    b.id = DetectionId(2);
    b.confidence = 0.7;
    b.bbox = BoundingBox {
        x1: 12.0,
        y1: 12.0,
        x2: 112.0,
        y2: 92.0,
    };
    let mut c = a.clone();
    c.id = DetectionId(3);
    c.bbox = BoundingBox {
        x1: 300.0,
        y1: 300.0,
        x2: 400.0,
        y2: 380.0,
    };
    for d in [&mut a, &mut b, &mut c] {
        d.state = DetectionState::Pending;
    }

    let once = dedup::suppress(vec![a, b, c], 0.5);
    let twice = dedup::suppress(once.clone(), 0.5);

    let survivors = |set: &[Detection]| -> Vec<DetectionId> {
        let mut ids: Vec<_> = set
            .iter()
            .filter(|d| d.state != DetectionState::Duplicate)
            .map(|d| d.id)
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(survivors(&once), vec![DetectionId(1), DetectionId(3)]);
    assert_eq!(survivors(&once), survivors(&twice));
}
