//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (directors reference existing backends)
//! - Validate value ranges (quorum, weights, probe windows)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EdgeConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::{EdgeConfig, ProbeConfig};
use crate::security::acl::IpRule;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),

    #[error("duplicate director name '{0}'")]
    DuplicateDirector(String),

    #[error("director '{director}' references unknown backend '{backend}'")]
    UnknownBackend { director: String, backend: String },

    #[error("director '{0}' has no members")]
    EmptyDirector(String),

    #[error("director '{0}' quorum must be within 0.0..=1.0")]
    QuorumRange(String),

    #[error("weight of '{0}' must be greater than zero")]
    ZeroWeight(String),

    #[error("director '{0}' needs at least one vnode per backend")]
    ZeroVnodes(String),

    #[error("probe for '{0}' needs threshold <= window <= 64 and initial <= window")]
    ProbeWindow(String),

    #[error("default director '{0}' is not defined")]
    UnknownDefaultDirector(String),

    #[error("invalid ACL entry '{0}'")]
    InvalidAcl(String),

    #[error("rate limit capacity and refill rate must be positive")]
    RateLimit,
}

fn probe_is_valid(probe: &ProbeConfig) -> bool {
    probe.window > 0
        && probe.window <= 64
        && probe.threshold <= probe.window
        && probe.initial <= probe.window
}

/// Validate a parsed configuration.
pub fn validate_config(config: &EdgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut backends = HashSet::new();
    for backend in &config.backends {
        if !backends.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        if backend.weight == 0 {
            errors.push(ValidationError::ZeroWeight(backend.name.clone()));
        }
        if let Some(probe) = &backend.probe {
            if !probe_is_valid(probe) {
                errors.push(ValidationError::ProbeWindow(backend.name.clone()));
            }
        }
    }
    if !probe_is_valid(&config.probe) {
        errors.push(ValidationError::ProbeWindow("<default>".to_string()));
    }

    let mut directors = HashSet::new();
    for director in &config.directors {
        if !directors.insert(director.name.as_str()) {
            errors.push(ValidationError::DuplicateDirector(director.name.clone()));
        }
        if director.members.is_empty() {
            errors.push(ValidationError::EmptyDirector(director.name.clone()));
        }
        if !(0.0..=1.0).contains(&director.quorum) {
            errors.push(ValidationError::QuorumRange(director.name.clone()));
        }
        if director.vnodes_per_backend == 0 {
            errors.push(ValidationError::ZeroVnodes(director.name.clone()));
        }
        for member in &director.members {
            if !backends.contains(member.backend.as_str()) {
                errors.push(ValidationError::UnknownBackend {
                    director: director.name.clone(),
                    backend: member.backend.clone(),
                });
            }
            if member.weight == Some(0) {
                errors.push(ValidationError::ZeroWeight(format!(
                    "{}/{}",
                    director.name, member.backend
                )));
            }
        }
    }

    if let Some(name) = &config.default_director {
        if !directors.contains(name.as_str()) {
            errors.push(ValidationError::UnknownDefaultDirector(name.clone()));
        }
    }

    for entry in &config.acl.deny {
        if entry.parse::<IpRule>().is_err() {
            errors.push(ValidationError::InvalidAcl(entry.clone()));
        }
    }

    if config.rate_limit.enabled
        && (config.rate_limit.capacity == 0 || config.rate_limit.refill_per_sec <= 0.0)
    {
        errors.push(ValidationError::RateLimit);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
