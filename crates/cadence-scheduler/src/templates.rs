use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::routing::JobType;

/// Display metadata for a unit of work, owned by an external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub template_ref: String,
    pub name: String,
    pub job_type: JobType,
}

/// Resolves the opaque `template_ref` stored on schedules and runs.
///
/// Templates can be deleted behind the engine's back, so `None` is a normal
/// answer and callers fall back to placeholder metadata.
pub trait TemplateCatalog: Send + Sync {
    fn resolve(&self, template_ref: &str) -> Option<JobTemplate>;
}

/// In-memory catalog built from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    templates: HashMap<String, JobTemplate>,
}

impl StaticCatalog {
    /// Build from `(template_ref, name, job_type)` triples. Job types are
    /// validated here so a typo fails at startup.
    pub fn from_entries<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    {
        let mut templates = HashMap::new();
        for (template_ref, name, job_type) in entries {
            let job_type: JobType = job_type.parse().map_err(SchedulerError::Config)?;
            if job_type == JobType::Unknown {
                return Err(SchedulerError::Config(format!(
                    "template {template_ref} must declare a concrete job type"
                )));
            }
            let previous = templates.insert(
                template_ref.to_string(),
                JobTemplate {
                    template_ref: template_ref.to_string(),
                    name: name.to_string(),
                    job_type,
                },
            );
            if previous.is_some() {
                return Err(SchedulerError::Config(format!(
                    "template {template_ref} is declared twice"
                )));
            }
        }
        Ok(Self { templates })
    }

    pub fn insert(&mut self, template: JobTemplate) {
        self.templates.insert(template.template_ref.clone(), template);
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateCatalog for StaticCatalog {
    fn resolve(&self, template_ref: &str) -> Option<JobTemplate> {
        self.templates.get(template_ref).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_configured_templates() {
        let catalog =
            StaticCatalog::from_entries([("tpl-1", "Core backup", "backup")]).unwrap();
        let tpl = catalog.resolve("tpl-1").unwrap();
        assert_eq!(tpl.job_type, JobType::Backup);
        assert!(catalog.resolve("tpl-deleted").is_none());
    }

    #[test]
    fn rejects_bad_entries() {
        assert!(StaticCatalog::from_entries([("tpl-1", "x", "teleport")]).is_err());
        assert!(StaticCatalog::from_entries([("tpl-1", "x", "unknown")]).is_err());
        assert!(
            StaticCatalog::from_entries([("tpl-1", "a", "scan"), ("tpl-1", "b", "scan")]).is_err()
        );
    }
}
