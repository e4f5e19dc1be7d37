//! Job definition sources.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use batchforge_core::{DefinitionError, JobDefinition};

/// Where the operator looks up job definitions by name.
pub trait JobDefinitionSource: Send + Sync {
    /// `Ok(None)` when no definition exists under `job_name`.
    fn load(&self, job_name: &str) -> Result<Option<JobDefinition>, DefinitionError>;

    /// Names of every known job.
    fn job_names(&self) -> Vec<String>;
}

impl<S: JobDefinitionSource + ?Sized> JobDefinitionSource for Arc<S> {
    fn load(&self, job_name: &str) -> Result<Option<JobDefinition>, DefinitionError> {
        (**self).load(job_name)
    }

    fn job_names(&self) -> Vec<String> {
        (**self).job_names()
    }
}

/// Definitions registered in code.
#[derive(Debug, Default)]
pub struct InMemoryDefinitionSource {
    definitions: RwLock<HashMap<String, JobDefinition>>,
}

impl InMemoryDefinitionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a definition after validating it.
    pub fn register(&self, definition: JobDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        let mut definitions = self.definitions.write().map_err(|_| poisoned(&definition.id))?;
        definitions.insert(definition.id.clone(), definition);
        Ok(())
    }
}

fn poisoned(name: &str) -> DefinitionError {
    DefinitionError::Unreadable {
        name: name.to_string(),
        reason: "lock poisoned".to_string(),
    }
}

impl JobDefinitionSource for InMemoryDefinitionSource {
    fn load(&self, job_name: &str) -> Result<Option<JobDefinition>, DefinitionError> {
        let definitions = self.definitions.read().map_err(|_| poisoned(job_name))?;
        Ok(definitions.get(job_name).cloned())
    }

    fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Definitions stored as `<dir>/<job name>.json`.
#[derive(Debug, Clone)]
pub struct JsonDefinitionSource {
    dir: PathBuf,
}

impl JsonDefinitionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl JobDefinitionSource for JsonDefinitionSource {
    fn load(&self, job_name: &str) -> Result<Option<JobDefinition>, DefinitionError> {
        let unreadable = |reason: String| DefinitionError::Unreadable {
            name: job_name.to_string(),
            reason,
        };

        // Job names map directly to file names.
        if job_name.is_empty() || job_name.contains(['/', '\\']) || job_name.starts_with('.') {
            return Ok(None);
        }

        let path = self.dir.join(format!("{job_name}.json"));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unreadable(format!("{}: {e}", path.display()))),
        };
        let definition: JobDefinition =
            serde_json::from_slice(&bytes).map_err(|e| unreadable(e.to_string()))?;

        if definition.id != job_name {
            return Err(unreadable(format!(
                "file declares job '{}'",
                definition.id
            )));
        }
        definition.validate()?;
        Ok(Some(definition))
    }

    fn job_names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use batchforge_core::StepDefinition;

    use super::*;

    fn numbers() -> JobDefinition {
        JobDefinition::new("numbers").step(StepDefinition::new("load", "numberReader", "numberWriter"))
    }

    #[test]
    fn in_memory_source_validates_on_register() {
        let source = InMemoryDefinitionSource::new();
        source.register(numbers()).unwrap();
        assert!(source.register(JobDefinition::new("empty")).is_err());

        assert_eq!(source.load("numbers").unwrap(), Some(numbers()));
        assert_eq!(source.load("missing").unwrap(), None);
        assert_eq!(source.job_names(), vec!["numbers".to_string()]);
    }

    #[test]
    fn json_source_reads_definition_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("numbers.json"),
            serde_json::to_vec(&numbers()).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), b"{").unwrap();

        let source = JsonDefinitionSource::new(dir.path());
        assert_eq!(source.load("numbers").unwrap(), Some(numbers()));
        assert_eq!(source.load("absent").unwrap(), None);
        assert!(matches!(
            source.load("broken"),
            Err(DefinitionError::Unreadable { .. })
        ));
        assert_eq!(source.load("../numbers").unwrap(), None);
        assert_eq!(source.job_names(), vec!["broken".to_string(), "numbers".to_string()]);
    }

    #[test]
    fn json_definition_uses_defaults() {
        let raw = r#"{
            "id": "numbers",
            "steps": [{
                "name": "load",
                "artifacts": { "reader": "numberReader", "writer": "numberWriter" },
                "properties": { "item-count": "5" },
                "rules": [
                    { "pattern": { "match": "family", "value": "transient" }, "action": "RETRY", "limit": 3 }
                ]
            }]
        }"#;
        let def: JobDefinition = serde_json::from_str(raw).unwrap();
        assert!(def.restartable);
        assert_eq!(def.steps[0].options().unwrap().chunk_size, 5);
        assert_eq!(def.steps[0].rules.len(), 1);
    }
}
