use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One acquired image. The embedding is computed lazily by the sampler and
/// cached here; it is never recomputed for the same file content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub source_url: Option<String>,
    pub local_path: PathBuf,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl ImageRecord {
    pub fn new(id: impl Into<String>, source_url: Option<String>, local_path: PathBuf) -> Self {
        Self { id: id.into(), source_url, local_path, embedding: None }
    }
}

/// Pipeline stages in execution order. Transitions are one-directional and
/// no stage is revisited; `Failed` is reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Searching,
    Sampling,
    AwaitingManualAnnotation,
    BootstrapTraining,
    AutoAnnotating,
    DatasetExpansion,
    Retraining,
    Exporting,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Searching => "searching",
            Stage::Sampling => "sampling",
            Stage::AwaitingManualAnnotation => "awaiting_manual_annotation",
            Stage::BootstrapTraining => "bootstrap_training",
            Stage::AutoAnnotating => "auto_annotating",
            Stage::DatasetExpansion => "dataset_expansion",
            Stage::Retraining => "retraining",
            Stage::Exporting => "exporting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "searching" => Ok(Stage::Searching),
            "sampling" => Ok(Stage::Sampling),
            "awaiting_manual_annotation" => Ok(Stage::AwaitingManualAnnotation),
            "bootstrap_training" => Ok(Stage::BootstrapTraining),
            "auto_annotating" => Ok(Stage::AutoAnnotating),
            "dataset_expansion" => Ok(Stage::DatasetExpansion),
            "retraining" => Ok(Stage::Retraining),
            "exporting" => Ok(Stage::Exporting),
            "done" => Ok(Stage::Done),
            "failed" => Ok(Stage::Failed),
            _ => Err(format!("unknown stage: {s}")),
        }
    }
}

/// Stage-level failures. Per-item failures (a single download or embedding)
/// are absorbed where they happen and never show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    #[error("no-candidates")]
    NoCandidates,
    #[error("no-annotations")]
    NoAnnotations,
    #[error("search-failed")]
    SearchFailed,
    #[error("training-failed")]
    TrainingFailed,
    #[error("inference-failed")]
    InferenceFailed,
    #[error("export-failed")]
    ExportFailed,
    #[error("timeout")]
    Timeout,
}

impl FailureReason {
    /// Process exit code reported by the CLI for a failed session.
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureReason::NoCandidates => 2,
            FailureReason::NoAnnotations => 3,
            FailureReason::TrainingFailed => 4,
            FailureReason::ExportFailed => 5,
            FailureReason::Timeout => 6,
            FailureReason::SearchFailed => 7,
            FailureReason::InferenceFailed => 8,
        }
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-candidates" => Ok(FailureReason::NoCandidates),
            "no-annotations" => Ok(FailureReason::NoAnnotations),
            "search-failed" => Ok(FailureReason::SearchFailed),
            "training-failed" => Ok(FailureReason::TrainingFailed),
            "inference-failed" => Ok(FailureReason::InferenceFailed),
            "export-failed" => Ok(FailureReason::ExportFailed),
            "timeout" => Ok(FailureReason::Timeout),
            _ => Err(format!("unknown failure reason: {s}")),
        }
    }
}

/// One end-to-end run of the pipeline for a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub query: String,
    pub stage: Stage,
    pub failure_reason: Option<FailureReason>,
    /// Last successfully trained model; survives an export failure.
    pub model_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Alphanumeric.sample_string(&mut rand::rng(), 12).to_lowercase(),
            query: query.into(),
            stage: Stage::Searching,
            failure_reason: None,
            model_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_string_round_trip() {
        for stage in [
            Stage::Searching,
            Stage::Sampling,
            Stage::AwaitingManualAnnotation,
            Stage::BootstrapTraining,
            Stage::AutoAnnotating,
            Stage::DatasetExpansion,
            Stage::Retraining,
            Stage::Exporting,
            Stage::Done,
            Stage::Failed,
        ] {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }

    #[test]
    fn failure_reason_round_trip() {
        for reason in [
            FailureReason::NoCandidates,
            FailureReason::NoAnnotations,
            FailureReason::SearchFailed,
            FailureReason::TrainingFailed,
            FailureReason::InferenceFailed,
            FailureReason::ExportFailed,
            FailureReason::Timeout,
        ] {
            assert_eq!(reason.to_string().parse::<FailureReason>().unwrap(), reason);
        }
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes: std::collections::HashSet<i32> = [
            FailureReason::NoCandidates,
            FailureReason::NoAnnotations,
            FailureReason::SearchFailed,
            FailureReason::TrainingFailed,
            FailureReason::InferenceFailed,
            FailureReason::ExportFailed,
            FailureReason::Timeout,
        ]
        .iter()
        .map(|r| r.exit_code())
        .collect();
        assert_eq!(codes.len(), 7);
        assert!(!codes.contains(&0));
    }
}
