//! In-memory study tree: the single owner of every loaded study, series and
//! sop. Everything else refers to entries here by uid.

use std::cmp::Ordering;

use crate::error::LoadStudyError;

/// Header attributes a loader extracts for each sop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SopHeader {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    pub instance_number: Option<i32>,
    /// False for sops without pixel data (reports, presentation states).
    pub is_image: bool,
}

/// The resource behind a loaded sop.
///
/// Dropping the data source releases whatever the loader allocated for it;
/// that drop is the sop's disposal.
pub trait SopDataSource: Send {
    fn header(&self) -> &SopHeader;
}

pub struct Sop {
    source: Box<dyn SopDataSource>,
}

impl Sop {
    pub fn new(source: Box<dyn SopDataSource>) -> Self {
        Self { source }
    }

    pub fn header(&self) -> &SopHeader {
        self.source.header()
    }

    pub fn sop_instance_uid(&self) -> &str {
        &self.header().sop_instance_uid
    }

    pub fn series_instance_uid(&self) -> &str {
        &self.header().series_instance_uid
    }

    pub fn study_instance_uid(&self) -> &str {
        &self.header().study_instance_uid
    }

    pub fn instance_number(&self) -> Option<i32> {
        self.header().instance_number
    }

    pub fn is_image(&self) -> bool {
        self.header().is_image
    }
}

impl std::fmt::Debug for Sop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sop")
            .field("sop_instance_uid", &self.sop_instance_uid())
            .finish()
    }
}

#[derive(Debug)]
pub struct Series {
    pub series_instance_uid: String,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    sops: Vec<Sop>,
}

impl Series {
    fn from_header(header: &SopHeader) -> Self {
        Self {
            series_instance_uid: header.series_instance_uid.clone(),
            series_number: header.series_number,
            series_description: header.series_description.clone(),
            modality: header.modality.clone(),
            sops: Vec::new(),
        }
    }

    pub fn sops(&self) -> &[Sop] {
        &self.sops
    }

    pub fn image_sops(&self) -> impl Iterator<Item = &Sop> {
        self.sops.iter().filter(|sop| sop.is_image())
    }

    pub fn sort_sops(&mut self) {
        self.sops.sort_by(compare_sops);
    }
}

#[derive(Debug)]
pub struct Study {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    series: Vec<Series>,
    load_error: Option<LoadStudyError>,
}

impl Study {
    fn from_header(header: &SopHeader) -> Self {
        Self {
            study_instance_uid: header.study_instance_uid.clone(),
            patient_id: header.patient_id.clone(),
            patient_name: header.patient_name.clone(),
            study_date: header.study_date.clone(),
            study_time: header.study_time.clone(),
            study_description: header.study_description.clone(),
            accession_number: header.accession_number.clone(),
            series: Vec::new(),
            load_error: None,
        }
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn sop_count(&self) -> usize {
        self.series.iter().map(|series| series.sops.len()).sum()
    }

    /// Error recorded by the load that populated this study, if it was partial.
    pub fn load_error(&self) -> Option<&LoadStudyError> {
        self.load_error.as_ref()
    }

    pub fn contains_sop(&self, sop_instance_uid: &str) -> bool {
        self.series.iter().any(|series| {
            series
                .sops
                .iter()
                .any(|sop| sop.sop_instance_uid() == sop_instance_uid)
        })
    }

    /// Series by series number, sops within each series by instance number.
    pub fn sort_series_and_sops(&mut self) {
        self.series.sort_by(compare_series);
        for series in &mut self.series {
            series.sort_sops();
        }
    }

    fn series_mut(&mut self, header: &SopHeader) -> &mut Series {
        let index = match self
            .series
            .iter()
            .position(|series| series.series_instance_uid == header.series_instance_uid)
        {
            Some(index) => index,
            None => {
                self.series.push(Series::from_header(header));
                self.series.len() - 1
            }
        };
        &mut self.series[index]
    }
}

fn compare_series(a: &Series, b: &Series) -> Ordering {
    compare_optional_number(a.series_number, b.series_number)
        .then_with(|| a.series_instance_uid.cmp(&b.series_instance_uid))
}

fn compare_sops(a: &Sop, b: &Sop) -> Ordering {
    compare_optional_number(a.instance_number(), b.instance_number())
        .then_with(|| a.sop_instance_uid().cmp(b.sop_instance_uid()))
}

fn compare_optional_number(a: Option<i32>, b: Option<i32>) -> Ordering {
    a.unwrap_or(i32::MAX).cmp(&b.unwrap_or(i32::MAX))
}

/// All studies known to one viewer, in arrival order.
#[derive(Debug, Default)]
pub struct StudyRepository {
    studies: Vec<Study>,
}

impl StudyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    pub fn sop_count(&self) -> usize {
        self.studies.iter().map(Study::sop_count).sum()
    }

    pub fn studies(&self) -> impl Iterator<Item = &Study> {
        self.studies.iter()
    }

    pub fn study(&self, study_instance_uid: &str) -> Option<&Study> {
        self.studies
            .iter()
            .find(|study| study.study_instance_uid == study_instance_uid)
    }

    pub fn study_mut(&mut self, study_instance_uid: &str) -> Option<&mut Study> {
        self.studies
            .iter_mut()
            .find(|study| study.study_instance_uid == study_instance_uid)
    }

    pub fn contains_study(&self, study_instance_uid: &str) -> bool {
        self.study(study_instance_uid).is_some()
    }

    /// True when the study is present and was loaded without errors.
    pub fn contains_complete_study(&self, study_instance_uid: &str) -> bool {
        self.study(study_instance_uid)
            .is_some_and(|study| study.load_error.is_none())
    }

    /// Adds one sop, creating its study and series on first sight.
    ///
    /// Returns false (and drops the sop) when a sop with the same uid is
    /// already in the study.
    pub fn add_sop(&mut self, sop: Sop) -> bool {
        let index = match self
            .studies
            .iter()
            .position(|study| study.study_instance_uid == sop.study_instance_uid())
        {
            Some(index) => index,
            None => {
                self.studies.push(Study::from_header(sop.header()));
                self.studies.len() - 1
            }
        };

        let study = &mut self.studies[index];
        if study.contains_sop(sop.sop_instance_uid()) {
            return false;
        }
        study.series_mut(sop.header()).sops.push(sop);
        true
    }

    /// Adds every sop; returns how many were new.
    pub fn add_sops(&mut self, sops: impl IntoIterator<Item = Sop>) -> usize {
        let mut added = 0;
        for sop in sops {
            if self.add_sop(sop) {
                added += 1;
            }
        }
        added
    }

    pub fn set_load_error(&mut self, study_instance_uid: &str, error: Option<LoadStudyError>) {
        if let Some(study) = self.study_mut(study_instance_uid) {
            study.load_error = error;
        }
    }

    /// Detaches a study; dropping the returned value disposes its sops.
    pub fn remove_study(&mut self, study_instance_uid: &str) -> Option<Study> {
        let index = self
            .studies
            .iter()
            .position(|study| study.study_instance_uid == study_instance_uid)?;
        Some(self.studies.remove(index))
    }

    pub fn patient_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for study in &self.studies {
            if !study.patient_id.is_empty() && !ids.contains(&study.patient_id) {
                ids.push(study.patient_id.clone());
            }
        }
        ids
    }

    pub fn study_uids(&self) -> Vec<String> {
        self.studies
            .iter()
            .map(|study| study.study_instance_uid.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.studies.clear();
    }
}
