//! Logical workspace: one image set per study, one display set per series,
//! kept in study order.

use std::cmp::Ordering;

use crate::error::{LoadStudyError, WorkspaceError};
use crate::grid::{DisplaySetRef, PhysicalWorkspace};
use crate::loader::StudyItem;
use crate::memento::Memorable;
use crate::study::{Study, StudyRepository};

/// What studies are ordered by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudySortKey {
    pub study_instance_uid: String,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
}

impl StudySortKey {
    pub fn of_study(study: &Study) -> Self {
        Self {
            study_instance_uid: study.study_instance_uid.clone(),
            study_date: study.study_date.clone(),
            study_time: study.study_time.clone(),
        }
    }

    pub fn of_item(item: &StudyItem) -> Self {
        Self {
            study_instance_uid: item.study_instance_uid.clone(),
            study_date: item.study_date.clone(),
            study_time: item.study_time.clone(),
        }
    }
}

pub trait StudyComparer: Send {
    fn compare(&self, a: &StudySortKey, b: &StudySortKey) -> Ordering;
}

/// Most recent first; studies without a date go last; ties by uid.
#[derive(Debug, Clone, Copy, Default)]
pub struct StudyDateComparer;

impl StudyComparer for StudyDateComparer {
    fn compare(&self, a: &StudySortKey, b: &StudySortKey) -> Ordering {
        let a_date = non_blank(a.study_date.as_deref());
        let b_date = non_blank(b.study_date.as_deref());
        let by_date = match (a_date, b_date) {
            (Some(a_date), Some(b_date)) => b_date.cmp(a_date).then_with(|| {
                let a_time = non_blank(a.study_time.as_deref()).unwrap_or("");
                let b_time = non_blank(b.study_time.as_deref()).unwrap_or("");
                b_time.cmp(a_time)
            }),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_date.then_with(|| a.study_instance_uid.cmp(&b.study_instance_uid))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySet {
    pub uid: String,
    pub study_instance_uid: String,
    pub name: String,
    pub modality: Option<String>,
    pub image_count: usize,
}

impl DisplaySet {
    pub fn reference(&self) -> DisplaySetRef {
        DisplaySetRef {
            study_instance_uid: self.study_instance_uid.clone(),
            display_set_uid: self.uid.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    pub study_instance_uid: String,
    pub name: String,
    pub patient_id: String,
    pub sort_key: StudySortKey,
    pub display_sets: Vec<DisplaySet>,
    /// Set only on placeholders for studies that failed to load.
    pub load_error: Option<LoadStudyError>,
}

impl ImageSet {
    pub fn is_placeholder(&self) -> bool {
        self.load_error.is_some()
    }

    fn from_study(study: &Study) -> Self {
        let display_sets = study
            .series()
            .iter()
            .filter_map(|series| {
                let image_count = series.image_sops().count();
                (image_count > 0).then(|| DisplaySet {
                    uid: series.series_instance_uid.clone(),
                    study_instance_uid: study.study_instance_uid.clone(),
                    name: series_name(series.series_number, series.series_description.as_deref()),
                    modality: series.modality.clone(),
                    image_count,
                })
            })
            .collect();

        Self {
            study_instance_uid: study.study_instance_uid.clone(),
            name: study_name(study.study_date.as_deref(), study.study_description.as_deref()),
            patient_id: study.patient_id.clone(),
            sort_key: StudySortKey::of_study(study),
            display_sets,
            load_error: None,
        }
    }

    fn placeholder(item: &StudyItem, error: LoadStudyError) -> Self {
        Self {
            study_instance_uid: item.study_instance_uid.clone(),
            name: study_name(item.study_date.as_deref(), item.study_description.as_deref()),
            patient_id: item.patient_id.clone(),
            sort_key: StudySortKey::of_item(item),
            display_sets: Vec::new(),
            load_error: Some(error),
        }
    }
}

fn study_name(date: Option<&str>, description: Option<&str>) -> String {
    match (non_blank(date), non_blank(description)) {
        (Some(date), Some(description)) => format!("{date} {description}"),
        (Some(date), None) => date.to_string(),
        (None, Some(description)) => description.to_string(),
        (None, None) => "Unknown study".to_string(),
    }
}

fn series_name(number: Option<i32>, description: Option<&str>) -> String {
    match (number, non_blank(description)) {
        (Some(number), Some(description)) => format!("{number}: {description}"),
        (Some(number), None) => format!("Series {number}"),
        (None, Some(description)) => description.to_string(),
        (None, None) => "Series".to_string(),
    }
}

#[derive(Debug, Default)]
pub struct LogicalWorkspace {
    image_sets: Vec<ImageSet>,
}

impl LogicalWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image_sets(&self) -> &[ImageSet] {
        &self.image_sets
    }

    pub fn len(&self) -> usize {
        self.image_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_sets.is_empty()
    }

    pub fn position(&self, study_instance_uid: &str) -> Option<usize> {
        self.image_sets
            .iter()
            .position(|image_set| image_set.study_instance_uid == study_instance_uid)
    }

    pub fn image_set(&self, study_instance_uid: &str) -> Option<&ImageSet> {
        self.position(study_instance_uid)
            .map(|index| &self.image_sets[index])
    }

    pub fn display_set_count(&self) -> usize {
        self.image_sets
            .iter()
            .map(|image_set| image_set.display_sets.len())
            .sum()
    }

    pub fn display_set(&self, reference: &DisplaySetRef) -> Option<&DisplaySet> {
        self.image_set(&reference.study_instance_uid)?
            .display_sets
            .iter()
            .find(|display_set| display_set.uid == reference.display_set_uid)
    }

    pub fn study_uids(&self) -> Vec<&str> {
        self.image_sets
            .iter()
            .map(|image_set| image_set.study_instance_uid.as_str())
            .collect()
    }

    fn display_set_refs(&self) -> impl Iterator<Item = DisplaySetRef> + '_ {
        self.image_sets
            .iter()
            .flat_map(|image_set| image_set.display_sets.iter().map(DisplaySet::reference))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalWorkspaceMemento {
    image_sets: Vec<ImageSet>,
}

impl Memorable for LogicalWorkspace {
    type Memento = LogicalWorkspaceMemento;

    fn create_memento(&self) -> Self::Memento {
        LogicalWorkspaceMemento {
            image_sets: self.image_sets.clone(),
        }
    }

    fn set_memento(&mut self, memento: Self::Memento) {
        self.image_sets = memento.image_sets;
    }
}

/// How an incremental insert changed the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A populated image set for the study already exists.
    Unchanged,
    /// The study has nothing to display and no image set was made.
    Empty,
    Inserted { index: usize },
    /// A failed-load placeholder was replaced by the real image set.
    Replaced { index: usize },
}

impl InsertOutcome {
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Inserted { index } | Self::Replaced { index } => Some(index),
            Self::Unchanged | Self::Empty => None,
        }
    }
}

/// Builds the logical workspace from the repository and keeps it sorted.
pub struct LayoutManager {
    comparer: Box<dyn StudyComparer>,
    allow_empty: bool,
    layout_completed: bool,
}

impl Default for LayoutManager {
    fn default() -> Self {
        Self::new(Box::new(StudyDateComparer))
    }
}

impl LayoutManager {
    pub fn new(comparer: Box<dyn StudyComparer>) -> Self {
        Self {
            comparer,
            allow_empty: false,
            layout_completed: false,
        }
    }

    pub fn with_allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    pub fn is_layout_completed(&self) -> bool {
        self.layout_completed
    }

    /// Builds, validates, lays out and fills, then sorts. Runs once.
    pub fn layout(
        &mut self,
        repository: &mut StudyRepository,
        logical: &mut LogicalWorkspace,
        physical: &mut PhysicalWorkspace,
    ) -> Result<(), WorkspaceError> {
        if self.layout_completed {
            return Err(WorkspaceError::LayoutAlreadyCompleted);
        }

        self.build_initial(repository, logical);
        self.validate(logical)?;

        let (rows, columns) = grid_for(logical.display_set_count());
        physical.set_image_box_grid(rows, columns)?;
        physical.fill_empty(logical.display_set_refs());

        // Boxes were filled in arrival order so the primary study shows first;
        // only now is the list put in study order.
        self.sort_image_sets(repository, logical);
        physical.select_default_image_box();
        self.layout_completed = true;
        Ok(())
    }

    /// An image set per study in the repository, in arrival order.
    pub fn build_initial(&self, repository: &mut StudyRepository, logical: &mut LogicalWorkspace) {
        for study_uid in repository.study_uids() {
            self.insert_incremental(repository, logical, &study_uid);
        }
    }

    pub fn validate(&self, logical: &LogicalWorkspace) -> Result<(), WorkspaceError> {
        let any_images = logical
            .image_sets
            .iter()
            .flat_map(|image_set| &image_set.display_sets)
            .any(|display_set| display_set.image_count > 0);
        if any_images || self.allow_empty {
            Ok(())
        } else {
            Err(WorkspaceError::NoVisibleDisplaySets)
        }
    }

    /// Adds the image set for one study from the repository.
    ///
    /// Before the first layout the set is appended; afterwards it goes to its
    /// place in the order of every known study.
    pub fn insert_incremental(
        &self,
        repository: &mut StudyRepository,
        logical: &mut LogicalWorkspace,
        study_instance_uid: &str,
    ) -> InsertOutcome {
        let existing = logical.position(study_instance_uid);
        if let Some(index) = existing {
            if !logical.image_sets[index].is_placeholder() {
                return InsertOutcome::Unchanged;
            }
        }

        let Some(study) = repository.study_mut(study_instance_uid) else {
            return InsertOutcome::Empty;
        };
        study.sort_series_and_sops();
        let image_set = ImageSet::from_study(study);
        if image_set.display_sets.is_empty() {
            log::debug!("Study {study_instance_uid} has nothing to display");
            return InsertOutcome::Empty;
        }

        match existing {
            Some(index) => {
                // The loaded headers may date the study differently from the
                // query result the placeholder was sorted by.
                logical.image_sets.remove(index);
                let index = self.add_image_set(repository, logical, image_set);
                InsertOutcome::Replaced { index }
            }
            None => {
                let index = self.add_image_set(repository, logical, image_set);
                InsertOutcome::Inserted { index }
            }
        }
    }

    /// Represents a study that could not be loaded. Not-found studies and
    /// studies already in the workspace get nothing.
    pub fn insert_placeholder(
        &self,
        repository: &StudyRepository,
        logical: &mut LogicalWorkspace,
        item: &StudyItem,
        error: LoadStudyError,
    ) -> InsertOutcome {
        if matches!(error, LoadStudyError::NotFound { .. })
            || logical.position(&item.study_instance_uid).is_some()
        {
            return InsertOutcome::Unchanged;
        }
        let index = self.add_image_set(repository, logical, ImageSet::placeholder(item, error));
        InsertOutcome::Inserted { index }
    }

    pub fn sort_image_sets(&self, repository: &StudyRepository, logical: &mut LogicalWorkspace) {
        let order = self.known_order(repository, logical);
        logical
            .image_sets
            .sort_by_key(|image_set| rank(&order, &image_set.sort_key));
    }

    fn add_image_set(
        &self,
        repository: &StudyRepository,
        logical: &mut LogicalWorkspace,
        image_set: ImageSet,
    ) -> usize {
        let mut index = logical.image_sets.len();
        if self.layout_completed {
            let mut order = self.known_order(repository, logical);
            if !order.contains(&image_set.sort_key) {
                order.push(image_set.sort_key.clone());
                order.sort_by(|a, b| self.comparer.compare(a, b));
            }
            let new_rank = rank(&order, &image_set.sort_key);
            index = logical
                .image_sets
                .partition_point(|existing| rank(&order, &existing.sort_key) <= new_rank);
        }
        logical.image_sets.insert(index, image_set);
        index
    }

    /// Every study the viewer knows of, loaded or represented by a placeholder,
    /// in comparer order.
    fn known_order(&self, repository: &StudyRepository, logical: &LogicalWorkspace) -> Vec<StudySortKey> {
        let mut order = repository
            .studies()
            .map(StudySortKey::of_study)
            .collect::<Vec<_>>();
        for image_set in &logical.image_sets {
            if !order
                .iter()
                .any(|key| key.study_instance_uid == image_set.study_instance_uid)
            {
                order.push(image_set.sort_key.clone());
            }
        }
        order.sort_by(|a, b| self.comparer.compare(a, b));
        order
    }
}

fn rank(order: &[StudySortKey], key: &StudySortKey) -> usize {
    order
        .iter()
        .position(|known| known.study_instance_uid == key.study_instance_uid)
        .unwrap_or(order.len())
}

/// Grid that shows as many display sets as possible, up to 4x4.
pub fn grid_for(display_sets: usize) -> (usize, usize) {
    match display_sets {
        0 | 1 => (1, 1),
        2 => (1, 2),
        3..=4 => (2, 2),
        5..=8 => (2, 4),
        9..=12 => (3, 4),
        _ => (4, 4),
    }
}
