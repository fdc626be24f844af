use anyhow::Result;

use crate::loader::StudyItem;
use crate::study::StudyRepository;

/// What a finder needs to know about the viewer it searches on behalf of.
///
/// Captured on the owner thread before the search starts so the finder never
/// reads the repository directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorSearchContext {
    pub patient_ids: Vec<String>,
    pub loaded_study_uids: Vec<String>,
}

impl PriorSearchContext {
    pub fn from_repository(repository: &StudyRepository) -> Self {
        Self {
            patient_ids: repository.patient_ids(),
            loaded_study_uids: repository.study_uids(),
        }
    }

    pub fn is_loaded(&self, study_instance_uid: &str) -> bool {
        self.loaded_study_uids
            .iter()
            .any(|uid| uid == study_instance_uid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorStudyFinderResult {
    pub studies: Vec<StudyItem>,
    /// False when the search may have missed candidates (cancelled, truncated).
    pub results_complete: bool,
}

impl PriorStudyFinderResult {
    pub fn complete(studies: Vec<StudyItem>) -> Self {
        Self {
            studies,
            results_complete: true,
        }
    }
}

/// Discovers studies related to the ones already in the viewer.
///
/// `find_prior_studies` runs on the background worker; `cancel` is called from
/// the owner thread while a search may be in progress.
pub trait PriorStudyFinder: Send + Sync {
    fn find_prior_studies(&self, context: &PriorSearchContext) -> Result<PriorStudyFinderResult>;

    fn cancel(&self);

    /// A null finder disables background loading altogether.
    fn is_null(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullPriorStudyFinder;

impl PriorStudyFinder for NullPriorStudyFinder {
    fn find_prior_studies(&self, _context: &PriorSearchContext) -> Result<PriorStudyFinderResult> {
        Ok(PriorStudyFinderResult::complete(Vec::new()))
    }

    fn cancel(&self) {}

    fn is_null(&self) -> bool {
        true
    }
}
