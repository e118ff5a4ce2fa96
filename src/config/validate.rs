//! Configuration validation.

use crate::config::{Config, ExtractorConfig, ExtractorKind, SeasonPeriod};
use crate::constants::{calendar::DAYS_IN_MONTH, workers};
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Validate the entire configuration.
pub fn validate_config(config: &Config) -> Result<()> {
    validate_extractors(config)?;
    validate_matching(config)?;
    validate_dedup(config)?;
    validate_workers(config)?;
    validate_seasonal(config)?;
    Ok(())
}

fn invalid(message: String) -> Error {
    Error::ConfigValidation { message }
}

/// Validate the ordered extractor list.
fn validate_extractors(config: &Config) -> Result<()> {
    if config.extractors.is_empty() {
        return Err(invalid("at least one extractor must be configured".to_string()));
    }

    let mut names = HashSet::new();
    for extractor in &config.extractors {
        if !names.insert(extractor.name.as_str()) {
            return Err(invalid(format!(
                "duplicate extractor name '{}'",
                extractor.name
            )));
        }
        validate_extractor(extractor)?;
    }

    Ok(())
}

/// Validate a single extractor entry.
pub fn validate_extractor(extractor: &ExtractorConfig) -> Result<()> {
    if extractor.name.trim().is_empty() {
        return Err(invalid("extractor name must not be empty".to_string()));
    }

    if !(extractor.weight.is_finite() && extractor.weight > 0.0) {
        return Err(invalid(format!(
            "extractor '{}' weight must be positive, got {}",
            extractor.name, extractor.weight
        )));
    }

    match extractor.kind {
        ExtractorKind::Onnx => {
            if extractor.model.is_none() {
                return Err(invalid(format!(
                    "onnx extractor '{}' requires a model path",
                    extractor.name
                )));
            }
            if extractor.input_size == 0 {
                return Err(invalid(format!(
                    "extractor '{}' input_size must be at least 1",
                    extractor.name
                )));
            }
        }
        ExtractorKind::Precomputed => {
            if extractor.version.as_deref().is_none_or(str::is_empty) {
                return Err(invalid(format!(
                    "precomputed extractor '{}' requires a version tag",
                    extractor.name
                )));
            }
        }
        ExtractorKind::CoatPattern => {}
    }

    Ok(())
}

/// Validate matching decision settings.
fn validate_matching(config: &Config) -> Result<()> {
    let matching = &config.matching;

    if !(0.0..=1.0).contains(&matching.threshold) {
        return Err(invalid(format!(
            "matching.threshold must be between 0.0 and 1.0, got {}",
            matching.threshold
        )));
    }

    if !(0.0..1.0).contains(&matching.tie_epsilon) {
        return Err(invalid(format!(
            "matching.tie_epsilon must be in [0.0, 1.0), got {}",
            matching.tie_epsilon
        )));
    }

    if matching.shortlist == 0 {
        return Err(invalid("matching.shortlist must be at least 1".to_string()));
    }

    if !(matching.min_blend_weight > 0.0 && matching.min_blend_weight <= 1.0) {
        return Err(invalid(format!(
            "matching.min_blend_weight must be in (0.0, 1.0], got {}",
            matching.min_blend_weight
        )));
    }

    if !(0.0..=1.0).contains(&matching.low_confidence) {
        return Err(invalid(format!(
            "matching.low_confidence must be between 0.0 and 1.0, got {}",
            matching.low_confidence
        )));
    }

    Ok(())
}

/// Validate deduplication settings.
fn validate_dedup(config: &Config) -> Result<()> {
    let dedup = &config.dedup;

    if !(dedup.iou_threshold > 0.0 && dedup.iou_threshold <= 1.0) {
        return Err(invalid(format!(
            "dedup.iou_threshold must be in (0.0, 1.0], got {}",
            dedup.iou_threshold
        )));
    }

    if !(dedup.temporal_similarity > 0.0 && dedup.temporal_similarity <= 1.0) {
        return Err(invalid(format!(
            "dedup.temporal_similarity must be in (0.0, 1.0], got {}",
            dedup.temporal_similarity
        )));
    }

    Ok(())
}

/// Validate worker pool settings.
fn validate_workers(config: &Config) -> Result<()> {
    let pool = &config.workers;

    if pool.count == 0 || pool.count > workers::MAX_COUNT {
        return Err(invalid(format!(
            "workers.count must be between 1 and {}, got {}",
            workers::MAX_COUNT,
            pool.count
        )));
    }

    if pool.extractor_timeout_ms == 0 {
        return Err(invalid(
            "workers.extractor_timeout_ms must be at least 1".to_string(),
        ));
    }

    if pool.backoff_initial_ms > pool.backoff_max_ms {
        return Err(invalid(format!(
            "workers.backoff_initial_ms ({}) exceeds workers.backoff_max_ms ({})",
            pool.backoff_initial_ms, pool.backoff_max_ms
        )));
    }

    Ok(())
}

/// Validate seasonal archive settings.
fn validate_seasonal(config: &Config) -> Result<()> {
    let seasonal = &config.seasonal;

    if let Some(ref name) = seasonal.extractor
        && config.extractor(name).is_none()
    {
        return Err(invalid(format!(
            "seasonal.extractor '{name}' is not a configured extractor"
        )));
    }

    if let Some(ref name) = seasonal.extractor
        && config.primary_extractor().is_some_and(|p| &p.name == name)
    {
        return Err(invalid(format!(
            "seasonal.extractor '{name}' cannot be the primary extractor"
        )));
    }

    if seasonal.periods.is_empty() {
        return Err(invalid("seasonal.periods must not be empty".to_string()));
    }

    let mut names = HashSet::new();
    let mut previous: Option<&SeasonPeriod> = None;
    for period in &seasonal.periods {
        validate_period(period)?;
        if !names.insert(period.name.as_str()) {
            return Err(invalid(format!(
                "duplicate season period '{}'",
                period.name
            )));
        }
        if let Some(prev) = previous
            && (prev.start_month, prev.start_day) >= (period.start_month, period.start_day)
        {
            return Err(invalid(format!(
                "season period '{}' must start after '{}'",
                period.name, prev.name
            )));
        }
        previous = Some(period);
    }

    Ok(())
}

fn validate_period(period: &SeasonPeriod) -> Result<()> {
    if period.name.trim().is_empty() || period.name.contains(char::is_whitespace) {
        return Err(invalid(format!(
            "season period name '{}' must be a non-empty word",
            period.name
        )));
    }

    if !(1..=12).contains(&period.start_month) {
        return Err(invalid(format!(
            "season period '{}' start_month must be 1-12, got {}",
            period.name, period.start_month
        )));
    }

    let max_day = DAYS_IN_MONTH[(period.start_month - 1) as usize];
    if !(1..=max_day).contains(&period.start_day) {
        return Err(invalid(format!(
            "season period '{}' start_day must be 1-{max_day}, got {}",
            period.name, period.start_day
        )));
    }

    Ok(())
}
