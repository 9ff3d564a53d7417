//! Orchestrator builder with dependency validation.

use crate::errors::{codes, ConfigurationError, CycleDetectedError, Result};
use crate::pipeline::Pipeline;
use crate::utils::is_valid_name;
use std::collections::{HashMap, HashSet};

/// A validated set of pipelines with their cross-pipeline dependencies.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    name: String,
    pipelines: Vec<Pipeline>,
}

impl Orchestrator {
    /// Starts building an orchestrator named `name`.
    pub fn builder(name: impl Into<String>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(name)
    }

    /// The orchestrator name, also the queue namespace of its pipelines.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pipelines in registration order.
    #[must_use]
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    /// Looks up a pipeline by name.
    #[must_use]
    pub fn pipeline(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|pipeline| pipeline.name() == name)
    }
}

/// Builder for [`Orchestrator`]s.
#[derive(Debug, Clone)]
pub struct OrchestratorBuilder {
    name: String,
    pipelines: Vec<Pipeline>,
}

impl OrchestratorBuilder {
    /// Creates a new orchestrator builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: Vec::new(),
        }
    }

    /// Registers a pipeline. Registration order is dispatch order.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Returns the number of registered pipelines.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Validates and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`SwitchboardError::Configuration`](crate::errors::SwitchboardError::Configuration)
    /// for invalid names, duplicates or unknown dependencies, and
    /// [`SwitchboardError::CycleDetected`](crate::errors::SwitchboardError::CycleDetected)
    /// when dependencies form a cycle.
    pub fn build(self) -> Result<Orchestrator> {
        if !is_valid_name(&self.name) {
            return Err(ConfigurationError::coded(
                codes::INVALID_NAME,
                format!("Orchestrator name '{}' is not a valid name", self.name),
            )
            .into());
        }
        if self.pipelines.is_empty() {
            return Err(ConfigurationError::coded(
                codes::NO_STAGES,
                format!("Orchestrator '{}' has no pipelines", self.name),
            )
            .into());
        }

        let mut dependencies: HashMap<&str, &[String]> = HashMap::new();
        for pipeline in &self.pipelines {
            if dependencies
                .insert(pipeline.name(), pipeline.depends_on())
                .is_some()
            {
                return Err(ConfigurationError::coded(
                    codes::DUPLICATE,
                    format!("Pipeline '{}' is registered twice", pipeline.name()),
                )
                .with_stages(vec![pipeline.name().to_string()])
                .into());
            }
        }

        for pipeline in &self.pipelines {
            if let Some(missing) = pipeline
                .depends_on()
                .iter()
                .find(|dependency| !dependencies.contains_key(dependency.as_str()))
            {
                return Err(ConfigurationError::coded(
                    codes::UNKNOWN_PIPELINE,
                    format!(
                        "Pipeline '{}' depends on unregistered pipeline '{missing}'",
                        pipeline.name()
                    ),
                )
                .with_stages(vec![pipeline.name().to_string(), missing.clone()])
                .into());
            }
        }

        detect_cycles(&self.pipelines, &dependencies)?;

        Ok(Orchestrator {
            name: self.name,
            pipelines: self.pipelines,
        })
    }
}

fn detect_cycles(
    pipelines: &[Pipeline],
    dependencies: &HashMap<&str, &[String]>,
) -> std::result::Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for pipeline in pipelines {
        if !visited.contains(pipeline.name()) {
            if let Some(cycle) = dfs_cycle(
                pipeline.name(),
                dependencies,
                &mut visited,
                &mut rec_stack,
                &mut path,
            ) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }
    Ok(())
}

fn dfs_cycle(
    node: &str,
    dependencies: &HashMap<&str, &[String]>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    for dep in dependencies.get(node).copied().unwrap_or_default() {
        if !visited.contains(dep) {
            if let Some(cycle) = dfs_cycle(dep, dependencies, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(dep) {
            let start = path.iter().position(|name| name == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep.clone());
            return Some(cycle);
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SwitchboardError;
    use crate::pipeline::Source;
    use crate::stages::StageDefinition;
    use crate::testing::RecordingProcessor;

    fn pipeline(name: &str, depends_on: &[&str]) -> Pipeline {
        depends_on
            .iter()
            .fold(Pipeline::builder(name), |builder, dep| builder.depends_on(*dep))
            .source(Source::passthrough("work"))
            .stage(StageDefinition::new("work", RecordingProcessor::new()).to_ground())
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_keeps_registration_order() {
        let orchestrator = OrchestratorBuilder::new("main")
            .pipeline(pipeline("cb1", &[]))
            .pipeline(pipeline("cb2", &["cb1"]))
            .pipeline(pipeline("cb3", &["cb1"]))
            .build()
            .unwrap();

        let names: Vec<&str> = orchestrator.pipelines().iter().map(Pipeline::name).collect();
        assert_eq!(names, vec!["cb1", "cb2", "cb3"]);
        assert!(orchestrator.pipeline("cb2").is_some());
        assert!(orchestrator.pipeline("cb9").is_none());
    }

    #[test]
    fn test_empty_orchestrator_rejected() {
        let err = OrchestratorBuilder::new("main").build().unwrap_err();
        assert!(matches!(err, SwitchboardError::Configuration(_)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let err = OrchestratorBuilder::new("main board")
            .pipeline(pipeline("cb1", &[]))
            .build()
            .unwrap_err();
        match err {
            SwitchboardError::Configuration(err) => assert_eq!(err.code(), Some(codes::INVALID_NAME)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_pipeline_rejected() {
        let err = OrchestratorBuilder::new("main")
            .pipeline(pipeline("cb1", &[]))
            .pipeline(pipeline("cb1", &[]))
            .build()
            .unwrap_err();
        match err {
            SwitchboardError::Configuration(err) => assert_eq!(err.code(), Some(codes::DUPLICATE)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = OrchestratorBuilder::new("main")
            .pipeline(pipeline("cb1", &["ghost"]))
            .build()
            .unwrap_err();
        match err {
            SwitchboardError::Configuration(err) => {
                assert_eq!(err.code(), Some(codes::UNKNOWN_PIPELINE));
                assert_eq!(err.stages, vec!["cb1".to_string(), "ghost".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let err = OrchestratorBuilder::new("main")
            .pipeline(pipeline("cb1", &["cb3"]))
            .pipeline(pipeline("cb2", &["cb1"]))
            .pipeline(pipeline("cb3", &["cb2"]))
            .build()
            .unwrap_err();
        match err {
            SwitchboardError::CycleDetected(err) => {
                assert_eq!(err.cycle_path, vec!["cb1", "cb3", "cb2", "cb1"]);
                assert_eq!(err.error_info.code, codes::PIPELINE_CYCLE);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = OrchestratorBuilder::new("main")
            .pipeline(pipeline("cb1", &["cb1"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::CycleDetected(_)));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let result = OrchestratorBuilder::new("main")
            .pipeline(pipeline("cb1", &[]))
            .pipeline(pipeline("cb2", &["cb1"]))
            .pipeline(pipeline("cb3", &["cb1"]))
            .pipeline(pipeline("cb4", &["cb2", "cb3"]))
            .build();
        assert!(result.is_ok());
    }
}
