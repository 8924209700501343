//! Backend and director registry.
//!
//! # Responsibilities
//! - Build backends and directors from configuration
//! - Resolve directors by name (and the default director)
//! - Provide the backend list to the health monitor

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EdgeConfig;
use crate::director::{Backend, Director, Member};

/// All backends and directors loaded at startup.
#[derive(Debug, Default)]
pub struct DirectorSet {
    backends: HashMap<String, Arc<Backend>>,
    /// Declaration order, used for deterministic iteration.
    backend_order: Vec<String>,
    directors: HashMap<String, Arc<Director>>,
    default_director: Option<String>,
}

impl DirectorSet {
    /// Build from a validated configuration.
    pub fn from_config(config: &EdgeConfig) -> Self {
        let mut set = Self::default();

        for backend_config in &config.backends {
            set.add_backend(Arc::new(Backend::from_config(backend_config)));
        }

        for director_config in &config.directors {
            let members: Vec<Member> = director_config
                .members
                .iter()
                .filter_map(|member| match set.backends.get(&member.backend) {
                    Some(backend) => Some(Member::with_weight(
                        backend.clone(),
                        member.weight.unwrap_or(backend.weight),
                    )),
                    None => {
                        tracing::warn!(
                            director = %director_config.name,
                            backend = %member.backend,
                            "Unknown director member"
                        );
                        None
                    }
                })
                .collect();

            let director = Director::new(
                director_config.name.clone(),
                director_config.policy,
                members,
                director_config.vnodes_per_backend,
                director_config.seed,
            )
            .with_quorum(director_config.quorum)
            .with_retries(director_config.retries)
            .with_fail_open(director_config.fail_open);

            set.add_director(Arc::new(director));
        }

        set.default_director = config
            .default_director
            .clone()
            .or_else(|| config.directors.first().map(|d| d.name.clone()));
        set
    }

    pub fn add_backend(&mut self, backend: Arc<Backend>) {
        if self.backends.insert(backend.name.clone(), backend.clone()).is_none() {
            self.backend_order.push(backend.name.clone());
        }
    }

    pub fn add_director(&mut self, director: Arc<Director>) {
        if self.default_director.is_none() {
            self.default_director = Some(director.name().to_string());
        }
        self.directors.insert(director.name().to_string(), director);
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default_director = Some(name.into());
    }

    /// Director by name, or the default director when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Option<Arc<Director>> {
        let name = name.or(self.default_director.as_deref())?;
        self.directors.get(name).cloned()
    }

    pub fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.get(name).cloned()
    }

    /// All backends in declaration order (for health checking).
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.backend_order
            .iter()
            .filter_map(|name| self.backends.get(name).cloned())
            .collect()
    }
}
