use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Category of a per-study load failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureReason {
    InUse,
    Nearline,
    Offline,
    NotFound,
    LoaderNotFound,
    LoadFailed,
}

impl FailureReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::InUse => "in use",
            Self::Nearline => "nearline",
            Self::Offline => "offline",
            Self::NotFound => "not found",
            Self::LoaderNotFound => "no loader",
            Self::LoadFailed => "failed",
        }
    }
}

/// Why a single study could not be (fully) loaded.
///
/// `LoadFailed` covers both complete failures (`failed == total`) and partial
/// loads, where the successfully loaded sops were still applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadStudyError {
    #[error("The study '{study_uid}' is currently in use and cannot be loaded.")]
    InUse { study_uid: String },

    #[error("The study '{study_uid}' is nearline and cannot be loaded.")]
    Nearline {
        study_uid: String,
        being_restored: bool,
    },

    #[error("The study '{study_uid}' is offline and cannot be loaded.")]
    Offline { study_uid: String },

    #[error("The specified study '{study_uid}' was not found.")]
    NotFound { study_uid: String },

    #[error("No study loader named '{loader}' is available for study '{study_uid}'.")]
    LoaderNotFound { study_uid: String, loader: String },

    #[error("{failed} of {total} sops failed to load for study '{study_uid}'.")]
    LoadFailed {
        study_uid: String,
        total: usize,
        failed: usize,
    },
}

impl LoadStudyError {
    pub fn load_failed(study_uid: impl Into<String>, total: usize, failed: usize) -> Self {
        Self::LoadFailed {
            study_uid: study_uid.into(),
            total,
            failed,
        }
    }

    pub fn study_uid(&self) -> &str {
        match self {
            Self::InUse { study_uid }
            | Self::Nearline { study_uid, .. }
            | Self::Offline { study_uid }
            | Self::NotFound { study_uid }
            | Self::LoaderNotFound { study_uid, .. }
            | Self::LoadFailed { study_uid, .. } => study_uid,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            Self::InUse { .. } => FailureReason::InUse,
            Self::Nearline { .. } => FailureReason::Nearline,
            Self::Offline { .. } => FailureReason::Offline,
            Self::NotFound { .. } => FailureReason::NotFound,
            Self::LoaderNotFound { .. } => FailureReason::LoaderNotFound,
            Self::LoadFailed { .. } => FailureReason::LoadFailed,
        }
    }

    pub fn total(&self) -> usize {
        match self {
            Self::LoadFailed { total, .. } => *total,
            _ => 0,
        }
    }

    pub fn failed(&self) -> usize {
        match self {
            Self::LoadFailed { failed, .. } => *failed,
            _ => 0,
        }
    }

    pub fn successful(&self) -> usize {
        self.total().saturating_sub(self.failed())
    }

    pub fn any_loaded(&self) -> bool {
        self.successful() > 0
    }

    pub fn partially_loaded(&self) -> bool {
        self.any_loaded() && self.failed() > 0
    }

    pub fn outcome(&self) -> LoadOutcome {
        if self.partially_loaded() {
            LoadOutcome::Loaded {
                total: self.total(),
                failed: self.failed(),
            }
        } else {
            LoadOutcome::Failed {
                reason: self.reason(),
                partial: false,
            }
        }
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        const CONTACT_ADMIN: &str = "Please contact your PACS administrator.";
        match self {
            Self::InUse { .. } => {
                "The study is currently in use and cannot be opened at this time.".to_string()
            }
            Self::Nearline {
                being_restored: true,
                ..
            } => "The study is nearline and is being restored. Try again later.".to_string(),
            Self::Nearline { .. } => {
                format!("The study is nearline and cannot be opened. {CONTACT_ADMIN}")
            }
            Self::Offline { .. } => {
                "The study is offline and cannot be opened at this time.".to_string()
            }
            Self::NotFound { .. } => "The study could not be found.".to_string(),
            Self::LoaderNotFound { .. } => {
                format!("The study could not be opened. {CONTACT_ADMIN}")
            }
            Self::LoadFailed { .. } if self.partially_loaded() => format!(
                "Only {} of {} images could be opened. {CONTACT_ADMIN}",
                self.successful(),
                self.total()
            ),
            Self::LoadFailed { .. } => {
                format!("The study could not be opened. {CONTACT_ADMIN}")
            }
        }
    }
}

/// Per-study result summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { total: usize, failed: usize },
    Failed { reason: FailureReason, partial: bool },
}

/// Everything that happened across one multi-study load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateOutcome {
    pub total_attempted: usize,
    pub failures: Vec<LoadStudyError>,
    pub find_failed: bool,
    pub find_results_complete: bool,
}

impl Default for AggregateOutcome {
    fn default() -> Self {
        Self {
            total_attempted: 0,
            failures: Vec::new(),
            find_failed: false,
            find_results_complete: true,
        }
    }
}

impl AggregateOutcome {
    pub fn has_failures(&self) -> bool {
        self.find_failed || !self.find_results_complete || !self.failures.is_empty()
    }

    pub fn failure_counts(&self) -> BTreeMap<FailureReason, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.reason()).or_insert(0) += 1;
        }
        counts
    }

    pub fn partial_count(&self) -> usize {
        self.failures
            .iter()
            .filter(|failure| failure.partially_loaded())
            .count()
    }

    pub fn into_error(self) -> Result<(), LoadMultipleStudiesError> {
        if self.has_failures() {
            Err(LoadMultipleStudiesError { outcome: self })
        } else {
            Ok(())
        }
    }

    /// One line, counts per category.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.find_failed {
            parts.push("the search for related studies failed".to_string());
        } else if !self.find_results_complete {
            parts.push("the search for related studies returned incomplete results".to_string());
        }

        let counts = self.failure_counts();
        if !counts.is_empty() {
            let total_failed: usize = counts.values().sum();
            let per_reason = counts
                .iter()
                .map(|(reason, count)| format!("{count} {}", reason.label()))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "{total_failed} of {} studies did not load completely ({per_reason})",
                self.total_attempted
            ));
        }

        if parts.is_empty() {
            format!("{} studies loaded", self.total_attempted)
        } else {
            let mut text = parts.join("; ");
            if let Some(first) = text.get(..1) {
                let upper = first.to_ascii_uppercase();
                text.replace_range(..1, &upper);
            }
            text.push('.');
            text
        }
    }
}

/// One consolidated error for a multi-study load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadMultipleStudiesError {
    outcome: AggregateOutcome,
}

impl LoadMultipleStudiesError {
    pub fn outcome(&self) -> &AggregateOutcome {
        &self.outcome
    }

    pub fn failures(&self) -> &[LoadStudyError] {
        &self.outcome.failures
    }

    pub fn find_failed(&self) -> bool {
        self.outcome.find_failed
    }

    pub fn find_results_complete(&self) -> bool {
        self.outcome.find_results_complete
    }

    pub fn total_attempted(&self) -> usize {
        self.outcome.total_attempted
    }
}

impl fmt::Display for LoadMultipleStudiesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.outcome.summary())
    }
}

impl std::error::Error for LoadMultipleStudiesError {}

/// Result of asking for one or more primary studies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadStudiesError {
    #[error("at least one study must be specified")]
    NoStudiesRequested,

    #[error(transparent)]
    Single(#[from] LoadStudyError),

    #[error(transparent)]
    Multiple(#[from] LoadMultipleStudiesError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkspaceError {
    #[error("The layout operation has resulted in no images to be displayed.")]
    NoVisibleDisplaySets,

    #[error("Layout has already been called.")]
    LayoutAlreadyCompleted,

    #[error("Invalid image box grid {rows}x{columns}; both dimensions must be positive.")]
    InvalidGrid { rows: usize, columns: usize },
}
