//! The owner context: the viewer owns the repository and both workspaces,
//! and is the only place they are mutated. Background prior loading reaches
//! it solely through hand-offs applied in [`ImageViewer::pump`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{
    AggregateOutcome, LoadMultipleStudiesError, LoadStudiesError, LoadStudyError, WorkspaceError,
};
use crate::finder::{PriorSearchContext, PriorStudyFinder};
use crate::grid::{PhysicalWorkspace, PhysicalWorkspaceMemento};
use crate::loader::{
    ApplyOutcome, LoadStudyArgs, LoadStudyOptions, LoadedStudy, PrefetchingStrategy,
    SingleStudyLoader, StudyItem, StudyLoaders,
};
use crate::memento::Memorable;
use crate::priors::{PriorHandoff, PriorRunSummary, PriorStudyLoader};
use crate::study::StudyRepository;
use crate::workspace::{
    InsertOutcome, LayoutManager, LogicalWorkspace, LogicalWorkspaceMemento, StudyComparer,
};

const PUMP_WAIT: Duration = Duration::from_millis(10);

/// Raised on the owner context; collect with [`ImageViewer::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    StudyLoaded {
        study_instance_uid: String,
        /// Set when only part of the study loaded.
        error: Option<LoadStudyError>,
    },
    StudyLoadFailed {
        study_instance_uid: String,
        error: LoadStudyError,
    },
    PriorLoadingActiveChanged(bool),
    LayoutCompleted,
    /// A prior arrived for a study that was already fully loaded.
    DuplicatePriorDiscarded { study_instance_uid: String },
    PriorStudiesFailed(LoadMultipleStudiesError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerOptions {
    pub load_priors: bool,
    pub online_only_priors: bool,
    pub allow_empty_viewer: bool,
    pub report_duplicate_priors: bool,
    pub placeholders_for_failed_priors: bool,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            load_priors: true,
            online_only_priors: true,
            allow_empty_viewer: false,
            report_duplicate_priors: false,
            placeholders_for_failed_priors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceMemento {
    logical: LogicalWorkspaceMemento,
    physical: PhysicalWorkspaceMemento,
}

pub struct ImageViewer {
    options: ViewerOptions,
    loaders: StudyLoaders,
    repository: StudyRepository,
    logical: LogicalWorkspace,
    physical: PhysicalWorkspace,
    layout_manager: LayoutManager,
    priors: PriorStudyLoader,
    prefetching: Vec<(String, Box<dyn PrefetchingStrategy>)>,
    events: VecDeque<ViewerEvent>,
    prior_failures: Vec<LoadStudyError>,
    prior_load_error: Option<LoadMultipleStudiesError>,
    prior_loading_active: bool,
    closed: bool,
}

impl ImageViewer {
    pub fn new(
        loaders: StudyLoaders,
        finder: Arc<dyn PriorStudyFinder>,
        physical: PhysicalWorkspace,
        options: ViewerOptions,
    ) -> Self {
        let prior_options = LoadStudyOptions {
            online_only: options.online_only_priors,
        };
        Self {
            priors: PriorStudyLoader::new(finder, loaders.clone(), prior_options),
            layout_manager: LayoutManager::default().with_allow_empty(options.allow_empty_viewer),
            options,
            loaders,
            repository: StudyRepository::new(),
            logical: LogicalWorkspace::new(),
            physical,
            prefetching: Vec::new(),
            events: VecDeque::new(),
            prior_failures: Vec::new(),
            prior_load_error: None,
            prior_loading_active: false,
            closed: false,
        }
    }

    pub fn with_comparer(mut self, comparer: Box<dyn StudyComparer>) -> Self {
        self.layout_manager =
            LayoutManager::new(comparer).with_allow_empty(self.options.allow_empty_viewer);
        self
    }

    pub fn options(&self) -> ViewerOptions {
        self.options
    }

    pub fn repository(&self) -> &StudyRepository {
        &self.repository
    }

    pub fn logical_workspace(&self) -> &LogicalWorkspace {
        &self.logical
    }

    pub fn physical_workspace(&self) -> &PhysicalWorkspace {
        &self.physical
    }

    pub fn physical_workspace_mut(&mut self) -> &mut PhysicalWorkspace {
        &mut self.physical
    }

    pub fn is_prior_loading_active(&self) -> bool {
        self.prior_loading_active
    }

    pub fn is_layout_completed(&self) -> bool {
        self.layout_manager.is_layout_completed()
    }

    /// Consolidated failure of the last prior run, if it had anything to report.
    pub fn prior_load_error(&self) -> Option<&LoadMultipleStudiesError> {
        self.prior_load_error.as_ref()
    }

    pub fn take_prior_load_error(&mut self) -> Option<LoadMultipleStudiesError> {
        self.prior_load_error.take()
    }

    pub fn drain_events(&mut self) -> Vec<ViewerEvent> {
        self.events.drain(..).collect()
    }

    /// Loads one study synchronously. A partial load still adds what loaded
    /// and then reports the partial error.
    pub fn load_study(&mut self, args: LoadStudyArgs) -> Result<(), LoadStudyError> {
        let study_uid = args.study_instance_uid.clone();
        match SingleStudyLoader::new(&self.loaders, args).load() {
            Ok(loaded) => {
                let error = loaded.error();
                self.add_loaded_study(loaded);
                match error {
                    Some(error) => Err(error),
                    None => Ok(()),
                }
            }
            Err(error) => {
                log::error!("Failed to load study {study_uid}: {error}");
                self.events.push_back(ViewerEvent::StudyLoadFailed {
                    study_instance_uid: study_uid,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Loads several studies, continuing past failures. A single request gets
    /// its own error back; several get one consolidated error.
    pub fn load_studies(&mut self, requests: Vec<LoadStudyArgs>) -> Result<(), LoadStudiesError> {
        if requests.is_empty() {
            return Err(LoadStudiesError::NoStudiesRequested);
        }
        if requests.len() == 1 {
            return requests
                .into_iter()
                .try_for_each(|args| self.load_study(args))
                .map_err(LoadStudiesError::from);
        }

        let mut outcome = AggregateOutcome {
            total_attempted: requests.len(),
            ..AggregateOutcome::default()
        };
        for args in requests {
            if let Err(error) = self.load_study(args) {
                outcome.failures.push(error);
            }
        }
        outcome.into_error().map_err(LoadStudiesError::from)
    }

    /// Lays out the loaded studies, then starts looking for priors.
    pub fn layout(&mut self) -> Result<(), WorkspaceError> {
        self.layout_manager
            .layout(&mut self.repository, &mut self.logical, &mut self.physical)?;
        self.events.push_back(ViewerEvent::LayoutCompleted);
        self.start_loading_priors();
        Ok(())
    }

    pub fn start_loading_priors(&mut self) -> bool {
        if self.closed || !self.options.load_priors {
            return false;
        }
        let context = PriorSearchContext::from_repository(&self.repository);
        let started = self.priors.start(context);
        if started {
            self.prior_failures.clear();
            self.prior_load_error = None;
        }
        started
    }

    /// Stops prior loading; returns once the worker has exited. Nothing it
    /// loaded afterwards reaches the workspace.
    pub fn stop_loading_priors(&mut self) {
        self.priors.stop();
        self.prior_failures.clear();
        self.set_prior_loading_active(false);
    }

    /// Applies every hand-off waiting right now. Returns how many were taken.
    pub fn pump(&mut self) -> usize {
        let mut taken = 0;
        while !self.closed {
            let Some((handoff, ack)) = self.priors.next_handoff() else {
                break;
            };
            if self.apply(handoff) {
                ack.complete();
            }
            taken += 1;
        }
        taken
    }

    /// Pumps until the prior run is over or `timeout` passes. Returns true if
    /// the run finished.
    pub fn pump_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.priors.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            if let Some((handoff, ack)) = self.priors.wait_handoff(PUMP_WAIT) {
                if self.apply(handoff) {
                    ack.complete();
                }
            }
        }
        self.pump();
        true
    }

    /// Stops prior loading and prefetching and releases every study.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_loading_priors();
        for (name, strategy) in &mut self.prefetching {
            log::debug!("Stopping {name} prefetching");
            strategy.stop();
        }
        self.prefetching.clear();
        self.physical.clear();
        self.logical = LogicalWorkspace::new();
        self.repository.clear();
        self.closed = true;
    }

    /// True when the hand-off was applied, false when it was discarded.
    fn apply(&mut self, handoff: PriorHandoff) -> bool {
        if self.closed {
            log::debug!("Viewer closed; discarding prior {}", handoff.describe());
            return false;
        }
        match handoff {
            PriorHandoff::ActiveChanged(active) => {
                self.set_prior_loading_active(active);
                true
            }
            PriorHandoff::Loaded(loaded) => self.apply_prior(loaded),
            PriorHandoff::Failed { item, error } => {
                self.apply_prior_failure(&item, error);
                true
            }
            PriorHandoff::Completed(summary) => {
                self.complete_prior_run(summary);
                true
            }
        }
    }

    fn apply_prior(&mut self, loaded: LoadedStudy) -> bool {
        let study_uid = loaded.study_instance_uid().to_string();
        if self.repository.contains_complete_study(&study_uid) {
            if self.options.report_duplicate_priors {
                log::info!("Prior study {study_uid} is already loaded; discarding it");
                self.events
                    .push_back(ViewerEvent::DuplicatePriorDiscarded {
                        study_instance_uid: study_uid,
                    });
            } else {
                log::debug!("Prior study {study_uid} is already loaded; discarding it");
            }
            return false;
        }

        let error = loaded.error();
        if let Some(error) = &error {
            self.prior_failures.push(error.clone());
        }
        self.add_loaded_study(loaded);
        true
    }

    fn apply_prior_failure(&mut self, item: &StudyItem, error: LoadStudyError) {
        if self.options.placeholders_for_failed_priors && self.layout_manager.is_layout_completed() {
            self.layout_manager
                .insert_placeholder(&self.repository, &mut self.logical, item, error.clone());
        }
        self.events.push_back(ViewerEvent::StudyLoadFailed {
            study_instance_uid: item.study_instance_uid.clone(),
            error: error.clone(),
        });
        self.prior_failures.push(error);
    }

    fn complete_prior_run(&mut self, summary: PriorRunSummary) {
        let outcome = AggregateOutcome {
            total_attempted: summary.total_attempted,
            failures: std::mem::take(&mut self.prior_failures),
            find_failed: summary.find_failed,
            find_results_complete: summary.find_results_complete,
        };
        match outcome.into_error() {
            Ok(()) => log::info!("All {} prior studies loaded", summary.total_attempted),
            Err(error) => {
                log::error!("Prior study loading: {error}");
                self.events
                    .push_back(ViewerEvent::PriorStudiesFailed(error.clone()));
                self.prior_load_error = Some(error);
            }
        }
    }

    /// Adds a loaded study to the repository and, once laid out, to the
    /// workspace and any empty image boxes.
    fn add_loaded_study(&mut self, loaded: LoadedStudy) {
        let study_uid = loaded.study_instance_uid().to_string();
        let loader_name = loaded.loader_name.clone();
        let error = loaded.error();
        if loaded.apply_to(&mut self.repository) == ApplyOutcome::Redundant {
            log::debug!("Study {study_uid} is already loaded");
            return;
        }

        if self.layout_manager.is_layout_completed() {
            let outcome =
                self.layout_manager
                    .insert_incremental(&mut self.repository, &mut self.logical, &study_uid);
            if let InsertOutcome::Inserted { .. } | InsertOutcome::Replaced { .. } = outcome {
                self.fill_empty_boxes(&study_uid);
            }
        }

        self.start_prefetching(&loader_name);
        self.events.push_back(ViewerEvent::StudyLoaded {
            study_instance_uid: study_uid,
            error,
        });
    }

    fn fill_empty_boxes(&mut self, study_uid: &str) {
        let Some(image_set) = self.logical.image_set(study_uid) else {
            return;
        };
        let references = image_set
            .display_sets
            .iter()
            .map(|display_set| display_set.reference())
            .collect::<Vec<_>>();
        self.physical.fill_empty(references);
    }

    /// One prefetching strategy per loader name, started after that loader's
    /// first study is in.
    fn start_prefetching(&mut self, loader_name: &str) {
        if self.prefetching.iter().any(|(name, _)| name == loader_name) {
            return;
        }
        if let Some(mut strategy) = self.loaders.create_prefetching_strategy(loader_name) {
            strategy.start(&self.repository);
            self.prefetching.push((loader_name.to_string(), strategy));
        }
    }

    fn set_prior_loading_active(&mut self, active: bool) {
        if self.prior_loading_active != active {
            self.prior_loading_active = active;
            self.events
                .push_back(ViewerEvent::PriorLoadingActiveChanged(active));
        }
    }
}

impl Memorable for ImageViewer {
    type Memento = WorkspaceMemento;

    fn create_memento(&self) -> Self::Memento {
        WorkspaceMemento {
            logical: self.logical.create_memento(),
            physical: self.physical.create_memento(),
        }
    }

    fn set_memento(&mut self, memento: Self::Memento) {
        self.logical.set_memento(memento.logical);
        self.physical.set_memento(memento.physical);
    }
}

impl Drop for ImageViewer {
    fn drop(&mut self) {
        for (_, strategy) in &mut self.prefetching {
            strategy.stop();
        }
    }
}
