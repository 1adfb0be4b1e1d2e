// Result Aggregation
// Job results, the pipeline report and its per-dimension breakdown

use crate::definition::models::MatrixSpec;
use crate::execution::matrix::MatrixBinding;
use crate::runners::StepResult;

use serde::Serialize;
use std::fmt;

/// Final status of one job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    /// At least one step failed
    Failed,
    /// Infrastructure problem, executor fault or cancellation
    Errored,
    /// Never dispatched (fail-fast or cancellation)
    Skipped,
}

impl JobStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Errored)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Errored => "errored",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    ServiceStartupTimeout,
    ServiceAcquisition,
    ExecutorFault,
    Cancelled,
}

/// Why a job ended up `Errored`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    /// Service or step the error is attributed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Result of one job instance
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub index: usize,
    pub name: String,
    pub binding: MatrixBinding,
    pub status: JobStatus,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub duration_ms: u64,
}

impl JobResult {
    /// A job that was never dispatched
    pub fn skipped(index: usize, name: impl Into<String>, binding: MatrixBinding) -> Self {
        Self {
            index,
            name: name.into(),
            binding,
            status: JobStatus::Skipped,
            steps: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn first_failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.status.is_failed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
}

/// Outcome counts for one value of one dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueBreakdown {
    pub value: String,
    /// Indices of the jobs bound to this value
    pub jobs: Vec<usize>,
    pub succeeded: usize,
    /// Failed or errored
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionBreakdown {
    pub dimension: String,
    pub values: Vec<ValueBreakdown>,
}

/// Aggregated report for a whole run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub status: PipelineStatus,
    pub cancelled: bool,
    pub jobs: Vec<JobResult>,
    pub dimensions: Vec<DimensionBreakdown>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// Process exit code for this result
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobResult> {
        self.jobs.iter().filter(|j| j.status.is_failure())
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Combine job results into the pipeline report.
///
/// Results may arrive in any order; they are sorted by enumeration index.
/// The pipeline succeeds only if every job succeeded.
pub fn aggregate(pipeline: &str, matrix: &MatrixSpec, mut jobs: Vec<JobResult>) -> PipelineResult {
    jobs.sort_by_key(|j| j.index);

    let status = if jobs.iter().all(|j| j.status == JobStatus::Succeeded) {
        PipelineStatus::Succeeded
    } else {
        PipelineStatus::Failed
    };

    let dimensions = matrix
        .dimensions
        .iter()
        .map(|dimension| DimensionBreakdown {
            dimension: dimension.name.clone(),
            values: dimension
                .values
                .iter()
                .map(|value| breakdown(&jobs, &dimension.name, value))
                .collect(),
        })
        .collect();

    PipelineResult {
        pipeline: pipeline.to_string(),
        status,
        cancelled: false,
        jobs,
        dimensions,
        duration_ms: 0,
    }
}

fn breakdown(jobs: &[JobResult], dimension: &str, value: &str) -> ValueBreakdown {
    let mut entry = ValueBreakdown {
        value: value.to_string(),
        jobs: Vec::new(),
        succeeded: 0,
        failed: 0,
        skipped: 0,
    };

    for job in jobs.iter().filter(|j| j.binding.get(dimension) == Some(value)) {
        entry.jobs.push(job.index);
        match job.status {
            JobStatus::Succeeded => entry.succeeded += 1,
            JobStatus::Failed | JobStatus::Errored => entry.failed += 1,
            JobStatus::Skipped => entry.skipped += 1,
        }
    }

    entry
}
