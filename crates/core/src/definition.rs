//! Job and step definitions as supplied by a definition source.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, DefinitionError};
use crate::failure::{ErrorKind, ErrorPattern};

/// Caller-supplied job parameters, attached verbatim to an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, String>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Overlay `overrides` on top of these parameters.
    pub fn merged(&self, overrides: &JobParameters) -> JobParameters {
        let mut merged = self.0.clone();
        merged.extend(overrides.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        JobParameters(merged)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobParameters {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Declared job parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// Job-level options recognized by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub restartable: bool,
}

impl JobOptions {
    /// Parameter key that overrides the definition's restartable flag.
    pub const RESTARTABLE: &'static str = "restartable";

    /// Resolve options from the definition default and start parameters.
    pub fn resolve(definition: &JobDefinition, params: &JobParameters) -> Result<Self, BatchError> {
        let restartable = match params.get(Self::RESTARTABLE) {
            None => definition.restartable,
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                BatchError::InvalidParameters(format!("{} = '{raw}'", Self::RESTARTABLE))
            })?,
        };
        Ok(Self { restartable })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// A complete, resolved job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Job name (the key callers start it by)
    pub id: String,
    #[serde(default = "default_restartable")]
    pub restartable: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub steps: Vec<StepDefinition>,
}

fn default_restartable() -> bool {
    true
}

impl JobDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            restartable: true,
            parameters: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_named(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Check structural invariants and that every step's options parse.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id.clone()));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.name.clone()));
            }
            step.options()?;
        }
        Ok(())
    }

    /// Apply declared defaults and check required parameters.
    pub fn resolve_parameters(&self, supplied: &JobParameters) -> Result<JobParameters, BatchError> {
        let mut resolved = supplied.clone();
        for spec in &self.parameters {
            if resolved.get(&spec.name).is_some() {
                continue;
            }
            match (&spec.default, spec.required) {
                (Some(default), _) => resolved.insert(spec.name.clone(), default.clone()),
                (None, true) => {
                    return Err(BatchError::InvalidParameters(format!(
                        "missing required parameter '{}'",
                        spec.name
                    )));
                }
                (None, false) => {}
            }
        }
        Ok(resolved)
    }
}

/// Names of the artifacts making up one chunk step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepArtifacts {
    pub reader: String,
    #[serde(default)]
    pub processor: Option<String>,
    pub writer: String,
    #[serde(default)]
    pub listener: Option<String>,
}

/// One chunk-oriented step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub artifacts: StepArtifacts,
    /// Step properties; recognized keys become [`StepOptions`], the rest are
    /// handed to artifacts untouched.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RetrySkipRule>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, reader: impl Into<String>, writer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifacts: StepArtifacts {
                reader: reader.into(),
                processor: None,
                writer: writer.into(),
                listener: None,
            },
            properties: BTreeMap::new(),
            rules: Vec::new(),
        }
    }

    pub fn processor(mut self, name: impl Into<String>) -> Self {
        self.artifacts.processor = Some(name.into());
        self
    }

    pub fn listener(mut self, name: impl Into<String>) -> Self {
        self.artifacts.listener = Some(name.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn chunk_size(self, size: usize) -> Self {
        self.property(StepOptions::ITEM_COUNT, size.to_string())
    }

    pub fn skip_limit(self, limit: u32) -> Self {
        self.property(StepOptions::SKIP_LIMIT, limit.to_string())
    }

    pub fn retry_limit(self, limit: u32) -> Self {
        self.property(StepOptions::RETRY_LIMIT, limit.to_string())
    }

    pub fn rule(mut self, rule: RetrySkipRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn options(&self) -> Result<StepOptions, DefinitionError> {
        StepOptions::from_properties(&self.properties)
    }
}

/// Typed step configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOptions {
    /// Items per chunk
    pub chunk_size: usize,
    /// Cap on skips across all rules (`None` = rules alone decide)
    pub skip_limit: Option<u32>,
    /// Cap on retries across all rules
    pub retry_limit: Option<u32>,
    /// Re-run the step on restart even if it completed before
    pub allow_start_if_complete: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            skip_limit: None,
            retry_limit: None,
            allow_start_if_complete: false,
        }
    }
}

impl StepOptions {
    pub const ITEM_COUNT: &'static str = "item-count";
    pub const SKIP_LIMIT: &'static str = "skip-limit";
    pub const RETRY_LIMIT: &'static str = "retry-limit";
    pub const ALLOW_START_IF_COMPLETE: &'static str = "allow-start-if-complete";

    /// Build options from a property map. Unrecognized keys are ignored.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self, DefinitionError> {
        let mut options = Self::default();
        for (key, value) in props {
            let invalid = || DefinitionError::invalid_option(key, value);
            match key.as_str() {
                Self::ITEM_COUNT => {
                    let size: usize = value.trim().parse().map_err(|_| invalid())?;
                    if size == 0 {
                        return Err(invalid());
                    }
                    options.chunk_size = size;
                }
                Self::SKIP_LIMIT => options.skip_limit = Some(value.trim().parse().map_err(|_| invalid())?),
                Self::RETRY_LIMIT => options.retry_limit = Some(value.trim().parse().map_err(|_| invalid())?),
                Self::ALLOW_START_IF_COMPLETE => {
                    options.allow_start_if_complete = parse_bool(value).ok_or_else(invalid)?
                }
                _ => {}
            }
        }
        Ok(options)
    }
}

/// What to do when a rule matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Retry,
    Skip,
    Fail,
}

/// Maximum occurrences a rule tolerates. Serialized as an integer, `-1` meaning
/// unlimited.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum OccurrenceLimit {
    Unlimited,
    AtMost(u32),
}

impl OccurrenceLimit {
    /// Whether the `occurrence`-th match (1-based) is still within the limit.
    pub fn permits(self, occurrence: u32) -> bool {
        match self {
            OccurrenceLimit::Unlimited => true,
            OccurrenceLimit::AtMost(max) => occurrence <= max,
        }
    }
}

impl TryFrom<i64> for OccurrenceLimit {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(OccurrenceLimit::Unlimited),
            v if v >= 0 && v <= u32::MAX as i64 => Ok(OccurrenceLimit::AtMost(v as u32)),
            v => Err(format!("invalid occurrence limit {v}")),
        }
    }
}

impl From<OccurrenceLimit> for i64 {
    fn from(value: OccurrenceLimit) -> Self {
        match value {
            OccurrenceLimit::Unlimited => -1,
            OccurrenceLimit::AtMost(max) => max as i64,
        }
    }
}

/// Whether a rule's occurrence counter survives a restart.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterScope {
    #[default]
    Persistent,
    ResetOnRestart,
}

/// Declarative retry/skip rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySkipRule {
    pub pattern: ErrorPattern,
    pub action: RuleAction,
    pub limit: OccurrenceLimit,
    #[serde(default)]
    pub scope: CounterScope,
}

impl RetrySkipRule {
    pub fn retry(pattern: ErrorPattern, limit: OccurrenceLimit) -> Self {
        Self {
            pattern,
            action: RuleAction::Retry,
            limit,
            scope: CounterScope::Persistent,
        }
    }

    pub fn skip(pattern: ErrorPattern, limit: OccurrenceLimit) -> Self {
        Self {
            pattern,
            action: RuleAction::Skip,
            limit,
            scope: CounterScope::Persistent,
        }
    }

    pub fn fail(pattern: ErrorPattern) -> Self {
        Self {
            pattern,
            action: RuleAction::Fail,
            limit: OccurrenceLimit::Unlimited,
            scope: CounterScope::Persistent,
        }
    }

    pub fn reset_on_restart(mut self) -> Self {
        self.scope = CounterScope::ResetOnRestart;
        self
    }

    pub fn matches(&self, kind: ErrorKind) -> bool {
        self.pattern.matches(kind)
    }
}
