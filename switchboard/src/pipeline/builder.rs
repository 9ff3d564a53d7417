//! Pipeline builder with validation.

use super::source::Source;
use crate::errors::{codes, ConfigurationError, ContractErrorInfo};
use crate::stages::{Next, StageDefinition};
use crate::utils::is_valid_name;
use std::collections::{HashMap, HashSet};

/// A validated pipeline definition: one source feeding a DAG of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    source: Source,
    stages: Vec<StageDefinition>,
    completion_threshold: Option<f64>,
    depends_on: Vec<String>,
}

impl Pipeline {
    /// Starts building a pipeline named `name`.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source.
    #[must_use]
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Stages in registration order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name() == name)
    }

    /// The explicit completion threshold, if one was set.
    #[must_use]
    pub fn completion_threshold(&self) -> Option<f64> {
        self.completion_threshold
    }

    /// Pipelines that must complete before this one is dispatched by an orchestrator.
    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

/// Builder for [`Pipeline`]s.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    source: Option<Source>,
    stages: Vec<StageDefinition>,
    completion_threshold: Option<f64>,
    depends_on: Vec<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            stages: Vec::new(),
            completion_threshold: None,
            depends_on: Vec::new(),
        }
    }

    /// Sets the source.
    #[must_use]
    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the minimum complete ratio for a run to finish as complete.
    #[must_use]
    pub fn completion_threshold(mut self, threshold: f64) -> Self {
        self.completion_threshold = Some(threshold);
        self
    }

    /// Declares a prerequisite pipeline.
    #[must_use]
    pub fn depends_on(mut self, pipeline: impl Into<String>) -> Self {
        self.depends_on.push(pipeline.into());
        self
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates and builds the pipeline.
    pub fn build(self) -> Result<Pipeline, ConfigurationError> {
        if !is_valid_name(&self.name) {
            return Err(ConfigurationError::coded(
                codes::INVALID_NAME,
                format!("Pipeline name '{}' is not a valid name", self.name),
            ));
        }
        if self.stages.is_empty() {
            return Err(ConfigurationError::coded(
                codes::NO_STAGES,
                format!("Pipeline '{}' has no stages", self.name),
            ));
        }
        let Some(source) = self.source else {
            return Err(ConfigurationError::coded(
                codes::NO_SOURCE,
                format!("Pipeline '{}' has no source", self.name),
            ));
        };
        if let Some(threshold) = self.completion_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigurationError::new(format!(
                    "Completion threshold {threshold} of pipeline '{}' is outside [0, 1]",
                    self.name
                )));
            }
        }

        let mut by_name: HashMap<&str, &StageDefinition> = HashMap::new();
        for stage in &self.stages {
            stage.validate()?;
            if by_name.insert(stage.name(), stage).is_some() {
                return Err(ConfigurationError::coded(
                    codes::DUPLICATE,
                    format!("Stage '{}' is defined twice", stage.name()),
                )
                .with_stages(vec![stage.name().to_string()]));
            }
        }

        if !self.stages.iter().any(|stage| stage.spec().reaches_ground()) {
            return Err(ConfigurationError::coded(
                codes::NO_GROUND,
                format!("No stage of pipeline '{}' routes to ground", self.name),
            ));
        }

        check_references(&source, &by_name)?;

        Ok(Pipeline {
            name: self.name,
            source,
            stages: self.stages,
            completion_threshold: self.completion_threshold,
            depends_on: self.depends_on,
        })
    }
}

/// Walks the `next` closure from the source entry and from every stage,
/// failing on the first undefined name. Also checks `dependencies`.
fn check_references(
    source: &Source,
    stages: &HashMap<&str, &StageDefinition>,
) -> Result<(), ConfigurationError> {
    let undefined = |referrer: &str, name: &str| {
        ConfigurationError::new(format!("'{referrer}' references undefined stage '{name}'"))
            .with_stages(vec![referrer.to_string(), name.to_string()])
            .with_error_info(
                ContractErrorInfo::new(
                    codes::UNDEFINED_STAGE,
                    format!("Stage '{name}' is not defined"),
                )
                .with_context_entry("referrer", referrer),
            )
    };

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&str, &str)> = vec![("source", source.entry())];
    stack.extend(stages.keys().map(|name| ("pipeline", *name)));

    while let Some((referrer, name)) = stack.pop() {
        if !visited.insert(name) {
            continue;
        }
        let stage = stages.get(name).ok_or_else(|| undefined(referrer, name))?;
        for next in &stage.spec().next {
            if let Next::Stage(target) = next {
                if !visited.contains(target.as_str()) {
                    stack.push((stage.name(), target.as_str()));
                }
            }
        }
        for dependency in &stage.spec().dependencies {
            if !stages.contains_key(dependency.as_str()) {
                return Err(undefined(stage.name(), dependency));
            }
        }
    }
    Ok(())
}
