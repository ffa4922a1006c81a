//! Runtime configuration for silt.
//!
//! All settings have sensible defaults and can be overridden either by
//! deserializing a [`SiltConfig`] from configuration files or through
//! `SILT_*` environment variables via [`SiltConfig::from_env`].

use serde::Deserialize;

/// Pipeline configuration.
///
/// The `project` value namespaces every key-value key, object key, and
/// catalog table this process touches, so multiple deployments can share
/// one set of backing stores.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiltConfig {
    /// Project identifier used as the namespace for all stored state.
    pub project: String,

    /// Prefix under which columnar artifacts are written in the object store.
    pub object_prefix: String,

    /// Maximum number of keys per object-store bulk delete request.
    pub object_batch_max: usize,

    /// Database name used when creating catalog tables.
    pub catalog_database: String,
}

impl Default for SiltConfig {
    fn default() -> Self {
        Self {
            project: "silt".into(),
            object_prefix: "lake".into(),
            object_batch_max: 1000,
            catalog_database: "silt_analytics".into(),
        }
    }
}

impl SiltConfig {
    /// Build a config from defaults plus `SILT_*` environment overrides.
    ///
    /// Recognized variables: `SILT_PROJECT`, `SILT_OBJECT_PREFIX`,
    /// `SILT_OBJECT_BATCH_MAX`, `SILT_CATALOG_DATABASE`. Unparseable
    /// numeric overrides are ignored in favor of the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("SILT_PROJECT") {
            cfg.project = v;
        }
        if let Ok(v) = std::env::var("SILT_OBJECT_PREFIX") {
            cfg.object_prefix = v;
        }
        if let Ok(v) = std::env::var("SILT_OBJECT_BATCH_MAX")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            cfg.object_batch_max = n;
        }
        if let Ok(v) = std::env::var("SILT_CATALOG_DATABASE") {
            cfg.catalog_database = v;
        }
        cfg
    }

    /// Reserved record kind for relation staging records.
    pub fn relation_kind(&self) -> String {
        format!("{}.relation", self.project)
    }

    /// Reserved record kind for relation index entries.
    pub fn relation_index_kind(&self) -> String {
        format!("{}.relation_index", self.project)
    }

    /// Reserved record kind for task metadata records.
    pub fn task_kind(&self) -> String {
        format!("{}.task", self.project)
    }
}
