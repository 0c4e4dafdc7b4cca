//! Shootout draft validation
//!
//! Runs in a fixed order so clients get deterministic first-failure
//! reporting: title/description bounds, DI tracks, signal chains, per-stage
//! parameter shapes, model reference syntax. Reason strings are stable API.

use std::path::Path;

use shootout_common::{Error, Result};

use crate::domain::entities::{ShootoutDraft, Stage, StageKind};

pub const TITLE_MAX: usize = 200;
pub const DESCRIPTION_MAX: usize = 2000;
pub const PARAMETER_MAX: usize = 512;
pub const GAIN_DB_LIMIT: f64 = 36.0;

/// Validate a draft; the first violation wins and nothing is persisted
pub fn validate_draft(draft: &ShootoutDraft) -> Result<()> {
    if draft.title.trim().is_empty() {
        return Err(Error::invalid("title", "non_empty_required"));
    }
    if draft.title.chars().count() > TITLE_MAX {
        return Err(Error::invalid("title", "too_long"));
    }

    if let Some(description) = &draft.description {
        if description.chars().count() > DESCRIPTION_MAX {
            return Err(Error::invalid("description", "too_long"));
        }
    }

    if draft.di_tracks.is_empty() {
        return Err(Error::invalid("di_tracks", "non_empty_required"));
    }
    for (index, track) in draft.di_tracks.iter().enumerate() {
        validate_relative_path(&track.path, &format!("di_tracks[{}].path", index))?;
    }

    if draft.signal_chains.is_empty() {
        return Err(Error::invalid("signal_chains", "non_empty_required"));
    }
    for (chain_index, chain) in draft.signal_chains.iter().enumerate() {
        if chain.name.trim().is_empty() {
            return Err(Error::invalid(
                format!("signal_chains[{}].name", chain_index),
                "non_empty_required",
            ));
        }
        if chain.stages.is_empty() {
            return Err(Error::invalid(
                format!("signal_chains[{}].stages", chain_index),
                "non_empty_required",
            ));
        }
        for (stage_index, stage) in chain.stages.iter().enumerate() {
            let field = format!(
                "signal_chains[{}].stages[{}].parameter",
                chain_index, stage_index
            );
            validate_stage(stage, &field)?;
        }
    }

    Ok(())
}

/// Per-kind parameter shape
fn validate_stage(stage: &Stage, field: &str) -> Result<()> {
    if stage.parameter.trim().is_empty() {
        return Err(Error::invalid(field, "non_empty_required"));
    }
    if stage.parameter.chars().count() > PARAMETER_MAX {
        return Err(Error::invalid(field, "too_long"));
    }

    match stage.kind {
        StageKind::Model => {
            if !is_valid_model_ref(&stage.parameter) {
                return Err(Error::invalid(field, "invalid_model_ref"));
            }
        }
        StageKind::Ir => {
            validate_relative_path(&stage.parameter, field)?;
        }
        StageKind::Gain => {
            let db: f64 = stage
                .parameter
                .trim()
                .parse()
                .map_err(|_| Error::invalid(field, "invalid_gain"))?;
            if !db.is_finite() || db.abs() > GAIN_DB_LIMIT {
                return Err(Error::invalid(field, "gain_out_of_range"));
            }
        }
        StageKind::Eq | StageKind::Reverb | StageKind::Delay => {
            // Free-form settings text; bounds already checked above
        }
    }
    Ok(())
}

/// Model references are identifier segments, optionally slash-separated
pub fn is_valid_model_ref(value: &str) -> bool {
    let segment = regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap();
    !value.is_empty()
        && value.len() <= 256
        && value.split('/').all(|part| segment.is_match(part))
}

/// Paths must stay inside the uploads root: relative, no traversal
fn validate_relative_path(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid(field, "non_empty_required"));
    }
    let path = Path::new(value);
    if path.is_absolute() || value.starts_with('/') || value.starts_with('\\') {
        return Err(Error::invalid(field, "absolute_path"));
    }
    let traverses = path.components().any(|component| {
        matches!(
            component,
            std::path::Component::ParentDir | std::path::Component::Prefix(_)
        )
    });
    if traverses {
        return Err(Error::invalid(field, "path_traversal"));
    }
    Ok(())
}
