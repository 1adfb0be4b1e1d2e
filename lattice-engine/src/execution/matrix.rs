// Matrix Strategy Expansion
// Expands a matrix specification into concrete job instances

use crate::definition::models::{MatrixSpec, PipelineDefinition, ServiceRequirement};
use crate::definition::validator::{DefinitionValidator, PlannedStep};
use crate::error::{DefinitionError, DefinitionResult};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One concrete value per dimension, in dimension declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatrixBinding {
    values: Vec<(String, String)>,
}

impl MatrixBinding {
    /// The binding of a matrix with no dimensions
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every key/value of a partial binding matches this one
    pub fn matches(&self, partial: &BTreeMap<String, String>) -> bool {
        partial
            .iter()
            .all(|(key, value)| self.get(key) == Some(value.as_str()))
    }

    /// Human readable label, e.g. `os=ubuntu, channel=nightly`
    pub fn label(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `MATRIX_<DIMENSION>` variables exported to every step
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (format!("MATRIX_{}", env_key(k)), v.clone()))
            .collect()
    }
}

impl fmt::Display for MatrixBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for MatrixBinding {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in &self.values {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Upper-case a name and replace anything outside `[A-Z0-9]` with `_`
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Everything a job instance needs that is shared by all matrix cells
#[derive(Debug)]
pub struct JobPlan {
    pub name: String,
    pub steps: Vec<PlannedStep>,
    pub services: Vec<ServiceRequirement>,
    pub env: BTreeMap<String, String>,
    /// Default step timeout from the job template
    pub timeout: Option<Duration>,
}

/// One matrix cell ready to be dispatched
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// Enumeration index in expansion order
    pub index: usize,
    pub binding: MatrixBinding,
    pub plan: Arc<JobPlan>,
}

impl JobInstance {
    /// Display name, e.g. `test (os=ubuntu, channel=nightly)`
    pub fn display_name(&self) -> String {
        if self.binding.is_empty() {
            self.plan.name.clone()
        } else {
            format!("{} ({})", self.plan.name, self.binding)
        }
    }
}

/// Matrix expander for job templates
pub struct MatrixExpander;

impl MatrixExpander {
    /// Validate a definition and expand it into job instances
    pub fn instances(definition: &PipelineDefinition) -> DefinitionResult<Vec<JobInstance>> {
        let steps = DefinitionValidator::validate(definition)?;
        let job = &definition.job;

        let plan = Arc::new(JobPlan {
            name: job.name.clone(),
            steps,
            services: job.services.clone(),
            env: job.env.clone(),
            timeout: job.timeout_secs.map(Duration::from_secs),
        });

        let bindings = Self::expand(&job.matrix);
        if bindings.is_empty() {
            return Err(DefinitionError::EmptyMatrix);
        }

        Ok(bindings
            .into_iter()
            .enumerate()
            .map(|(index, binding)| JobInstance {
                index,
                binding,
                plan: Arc::clone(&plan),
            })
            .collect())
    }

    /// Cross-product of the dimensions with exclusions applied.
    ///
    /// The first dimension varies slowest. A matrix with no dimensions yields
    /// exactly one empty binding.
    pub fn expand(matrix: &MatrixSpec) -> Vec<MatrixBinding> {
        let mut bindings: Vec<Vec<(String, String)>> = vec![Vec::new()];

        for dimension in &matrix.dimensions {
            bindings = bindings
                .into_iter()
                .flat_map(|prefix| {
                    dimension.values.iter().map(move |value| {
                        let mut next = prefix.clone();
                        next.push((dimension.name.clone(), value.clone()));
                        next
                    })
                })
                .collect();
        }

        bindings
            .into_iter()
            .map(|values| MatrixBinding { values })
            .filter(|binding| !matrix.exclude.iter().any(|entry| binding.matches(entry)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::models::{Dimension, JobTemplate, StepSpec};

    fn dimension(name: &str, values: &[&str]) -> Dimension {
        Dimension {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_expand_first_dimension_slowest() {
        let matrix = MatrixSpec {
            dimensions: vec![
                dimension("os", &["ubuntu", "macos"]),
                dimension("rust", &["stable", "beta", "nightly"]),
            ],
            exclude: vec![],
        };

        let labels: Vec<String> = MatrixExpander::expand(&matrix)
            .iter()
            .map(MatrixBinding::label)
            .collect();

        assert_eq!(
            labels,
            vec![
                "os=ubuntu, rust=stable",
                "os=ubuntu, rust=beta",
                "os=ubuntu, rust=nightly",
                "os=macos, rust=stable",
                "os=macos, rust=beta",
                "os=macos, rust=nightly",
            ]
        );
    }

    #[test]
    fn test_expand_size_is_product() {
        let matrix = MatrixSpec {
            dimensions: vec![
                dimension("a", &["1", "2"]),
                dimension("b", &["1", "2", "3"]),
                dimension("c", &["1", "2", "3", "4"]),
            ],
            exclude: vec![],
        };
        assert_eq!(MatrixExpander::expand(&matrix).len(), 24);
        assert_eq!(matrix.cross_product_len(), 24);
    }

    #[test]
    fn test_expand_no_dimensions() {
        let bindings = MatrixExpander::expand(&MatrixSpec::default());
        assert_eq!(bindings, vec![MatrixBinding::empty()]);
    }

    #[test]
    fn test_expand_with_exclusions() {
        let matrix = MatrixSpec {
            dimensions: vec![
                dimension("os", &["ubuntu", "windows"]),
                dimension("rust", &["stable", "nightly"]),
            ],
            exclude: vec![BTreeMap::from([
                ("os".to_string(), "windows".to_string()),
                ("rust".to_string(), "nightly".to_string()),
            ])],
        };

        let bindings = MatrixExpander::expand(&matrix);
        assert_eq!(bindings.len(), 3);
        assert!(!bindings
            .iter()
            .any(|b| b.get("os") == Some("windows") && b.get("rust") == Some("nightly")));
    }

    #[test]
    fn test_instances_share_plan_and_index_in_order() {
        let definition = PipelineDefinition {
            name: "ci".to_string(),
            fail_fast: true,
            job: JobTemplate {
                name: "test".to_string(),
                matrix: MatrixSpec {
                    dimensions: vec![dimension("channel", &["nightly", "stable"])],
                    exclude: vec![],
                },
                steps: vec![StepSpec {
                    name: "build".to_string(),
                    run: "true".to_string(),
                    ..Default::default()
                }],
                timeout_secs: Some(30),
                ..Default::default()
            },
            ..Default::default()
        };

        let instances = MatrixExpander::instances(&definition).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].index, 0);
        assert_eq!(instances[1].index, 1);
        assert!(Arc::ptr_eq(&instances[0].plan, &instances[1].plan));
        assert_eq!(instances[0].plan.timeout, Some(Duration::from_secs(30)));
        assert_eq!(instances[1].display_name(), "test (channel=stable)");
    }

    #[test]
    fn test_instances_reject_fully_excluded_matrix() {
        let definition = PipelineDefinition {
            name: "ci".to_string(),
            job: JobTemplate {
                name: "test".to_string(),
                matrix: MatrixSpec {
                    dimensions: vec![dimension("os", &["ubuntu"])],
                    exclude: vec![BTreeMap::from([("os".to_string(), "ubuntu".to_string())])],
                },
                steps: vec![StepSpec {
                    name: "build".to_string(),
                    run: "true".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            MatrixExpander::instances(&definition).unwrap_err(),
            DefinitionError::EmptyMatrix
        );
    }

    #[test]
    fn test_binding_env_and_serialization() {
        let binding = MatrixBinding::from_pairs([("os", "ubuntu"), ("rust-version", "1.75")]);
        assert_eq!(
            binding.env_vars(),
            vec![
                ("MATRIX_OS".to_string(), "ubuntu".to_string()),
                ("MATRIX_RUST_VERSION".to_string(), "1.75".to_string()),
            ]
        );
        assert_eq!(
            serde_json::to_string(&binding).unwrap(),
            r#"{"os":"ubuntu","rust-version":"1.75"}"#
        );
    }
}
