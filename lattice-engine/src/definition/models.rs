// Definition Models
// Format-agnostic pipeline definition consumed by the scheduler

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Immutable input describing one matrix pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Events that start a run
    #[serde(default)]
    pub triggers: TriggerSet,

    /// Stop launching new matrix cells once one fails
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,

    /// The job template expanded once per matrix binding
    pub job: JobTemplate,
}

fn default_fail_fast() -> bool {
    true
}

/// Trigger configuration, loaded once per run and read-only afterwards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSet {
    #[serde(default)]
    pub push: Option<BranchFilter>,

    #[serde(default)]
    pub pull_request: Option<BranchFilter>,

    #[serde(default)]
    pub schedule: Vec<Schedule>,
}

/// Branch filter; an empty list accepts every branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFilter {
    #[serde(default)]
    pub branches: Vec<String>,
}

impl BranchFilter {
    /// Patterns are exact names or a prefix followed by a trailing `*`
    pub fn accepts(&self, branch: Option<&str>) -> bool {
        if self.branches.is_empty() {
            return true;
        }
        let Some(branch) = branch else {
            return false;
        };
        self.branches.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => branch.starts_with(prefix),
            None => pattern == branch,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub cron: String,
}

/// Kind of event a run was started by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Schedule,
    Manual,
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pr" => Ok(TriggerKind::PullRequest),
            "schedule" | "cron" => Ok(TriggerKind::Schedule),
            "manual" => Ok(TriggerKind::Manual),
            other => Err(format!("unknown trigger event '{}'", other)),
        }
    }
}

impl TriggerSet {
    /// Whether an event of `kind` on `branch` starts this pipeline.
    ///
    /// Manual runs are always accepted. A definition with no triggers at all
    /// accepts every event.
    pub fn accepts(&self, kind: TriggerKind, branch: Option<&str>) -> bool {
        if self.is_empty() {
            return true;
        }
        match kind {
            TriggerKind::Manual => true,
            TriggerKind::Push => self.push.as_ref().is_some_and(|f| f.accepts(branch)),
            TriggerKind::PullRequest => self
                .pull_request
                .as_ref()
                .is_some_and(|f| f.accepts(branch)),
            TriggerKind::Schedule => !self.schedule.is_empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.push.is_none() && self.pull_request.is_none() && self.schedule.is_empty()
    }
}

/// Job template shared by every matrix cell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,

    #[serde(default)]
    pub matrix: MatrixSpec,

    /// Ephemeral services started for each job instance, in order
    #[serde(default)]
    pub services: Vec<ServiceRequirement>,

    pub steps: Vec<StepSpec>,

    /// Environment shared by every step (values may use ${{ }})
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Upper bound on concurrently running job instances
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Default step timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One named matrix axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dimension {
    pub name: String,
    pub values: Vec<String>,
}

/// Ordered matrix dimensions plus exclusions.
///
/// Deserialised from a mapping whose keys are dimension names (in document
/// order) and an optional `exclude` key holding partial bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixSpec {
    pub dimensions: Vec<Dimension>,
    pub exclude: Vec<BTreeMap<String, String>>,
}

impl MatrixSpec {
    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    /// Number of bindings before exclusions are applied
    pub fn cross_product_len(&self) -> usize {
        self.dimensions.iter().map(|d| d.values.len()).product()
    }
}

impl Serialize for MatrixSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(!self.exclude.is_empty());
        let mut map = serializer.serialize_map(Some(self.dimensions.len() + extra))?;
        for dimension in &self.dimensions {
            map.serialize_entry(&dimension.name, &dimension.values)?;
        }
        if !self.exclude.is_empty() {
            map.serialize_entry("exclude", &self.exclude)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MatrixVisitor;

        impl<'de> Visitor<'de> for MatrixVisitor {
            type Value = MatrixSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of dimension name to a list of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<MatrixSpec, A::Error> {
                let mut spec = MatrixSpec::default();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "exclude" {
                        let entries: Vec<BTreeMap<String, Scalar>> = map.next_value()?;
                        spec.exclude = entries
                            .into_iter()
                            .map(|entry| entry.into_iter().map(|(k, v)| (k, v.0)).collect())
                            .collect();
                    } else {
                        let values: Vec<Scalar> = map.next_value()?;
                        spec.dimensions.push(Dimension {
                            name: key,
                            values: values.into_iter().map(|v| v.0).collect(),
                        });
                    }
                }
                Ok(spec)
            }

            fn visit_unit<E: de::Error>(self) -> Result<MatrixSpec, E> {
                Ok(MatrixSpec::default())
            }
        }

        deserializer.deserialize_map(MatrixVisitor)
    }
}

/// Scalar matrix value normalised to its string form
#[derive(Debug, Clone, PartialEq, Eq)]
struct Scalar(String);

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = Scalar;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
                Ok(Scalar(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// One ordered unit of work in the job template
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the job
    pub name: String,

    /// Executable to launch (resolved through PATH)
    pub run: String,

    /// Arguments (may use ${{ }})
    #[serde(default)]
    pub args: Vec<String>,

    /// Guard evaluated against the matrix binding
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Run even after an earlier step failed
    #[serde(default)]
    pub always: bool,

    /// A failure of this step does not stop the remaining steps
    #[serde(default)]
    pub continue_on_error: bool,

    /// Step-specific environment (may use ${{ }})
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub working_dir: Option<String>,
}

/// How a service is started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// A container started through the docker CLI
    #[default]
    Docker,
    /// A local child process
    Process,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Docker => write!(f, "docker"),
            ServiceKind::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Declaration of an ephemeral dependency scoped to one job instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRequirement {
    /// Service name, unique within the job; also the env var prefix
    pub name: String,

    #[serde(default)]
    pub kind: ServiceKind,

    /// Container image (docker services)
    #[serde(default)]
    pub image: Option<String>,

    /// Command line (process services); `{port}` is replaced by the host port
    #[serde(default)]
    pub command: Vec<String>,

    /// Port the service listens on inside its container
    #[serde(default)]
    pub port: Option<u16>,

    /// Fixed credentials; generated per instance when absent
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Virtual namespace (vhost); generated per instance when absent
    #[serde(default)]
    pub namespace: Option<String>,

    /// Environment passed to the service. Values may contain `{user}`,
    /// `{password}`, `{namespace}` and `{port}` placeholders.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Readiness probe command run inside the service; when absent the
    /// manager probes the allocated TCP port
    #[serde(default)]
    pub health_cmd: Vec<String>,

    /// Startup timeout override in seconds
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_preserves_declaration_order() {
        let yaml = r#"
toolchain: [stable, beta, nightly]
os: [ubuntu-latest, macos-latest]
version: [1.56, 2]
"#;
        let spec: MatrixSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.dimension_names(), vec!["toolchain", "os", "version"]);
        assert_eq!(spec.dimensions[0].values, vec!["stable", "beta", "nightly"]);
        assert_eq!(spec.dimensions[2].values, vec!["1.56", "2"]);
        assert_eq!(spec.cross_product_len(), 12);
    }

    #[test]
    fn test_matrix_exclude() {
        let yaml = r#"
os: [ubuntu, windows]
rust: [stable, nightly]
exclude:
  - os: windows
    rust: nightly
"#;
        let spec: MatrixSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.dimensions.len(), 2);
        assert_eq!(spec.exclude.len(), 1);
        assert_eq!(spec.exclude[0].get("os"), Some(&"windows".to_string()));
    }

    #[test]
    fn test_matrix_serializes_in_definition_shape() {
        let yaml = r#"
os: [ubuntu, windows]
rust: [stable, "1.70"]
exclude:
  - os: windows
    rust: stable
"#;
        let spec: MatrixSpec = serde_yaml::from_str(yaml).unwrap();
        let written = serde_yaml::to_string(&spec).unwrap();
        assert!(written.starts_with("os:"));
        assert!(!written.contains("dimensions"));

        let reread: MatrixSpec = serde_yaml::from_str(&written).unwrap();
        assert_eq!(reread, spec);

        let empty = serde_json::to_value(MatrixSpec::default()).unwrap();
        assert_eq!(empty, serde_json::json!({}));
    }

    #[test]
    fn test_branch_filter() {
        let filter = BranchFilter {
            branches: vec!["main".to_string(), "release/*".to_string()],
        };
        assert!(filter.accepts(Some("main")));
        assert!(filter.accepts(Some("release/1.0")));
        assert!(!filter.accepts(Some("feature/x")));
        assert!(!filter.accepts(None));
        assert!(BranchFilter::default().accepts(None));
    }

    #[test]
    fn test_trigger_set_accepts() {
        let triggers = TriggerSet {
            push: Some(BranchFilter {
                branches: vec!["main".to_string()],
            }),
            pull_request: Some(BranchFilter::default()),
            schedule: vec![],
        };
        assert!(triggers.accepts(TriggerKind::Push, Some("main")));
        assert!(!triggers.accepts(TriggerKind::Push, Some("dev")));
        assert!(triggers.accepts(TriggerKind::PullRequest, Some("anything")));
        assert!(!triggers.accepts(TriggerKind::Schedule, None));
        assert!(triggers.accepts(TriggerKind::Manual, None));
        assert!(TriggerSet::default().accepts(TriggerKind::Schedule, None));
    }

    #[test]
    fn test_trigger_kind_from_str() {
        assert_eq!("push".parse::<TriggerKind>(), Ok(TriggerKind::Push));
        assert_eq!(
            "pull-request".parse::<TriggerKind>(),
            Ok(TriggerKind::PullRequest)
        );
        assert!("deploy".parse::<TriggerKind>().is_err());
    }
}
