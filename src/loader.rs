//! Loader services and the per-study load they drive.
//!
//! A [`StudyLoader`] is one loading session for one study. Sessions come from
//! a [`StudyLoaderFactory`] registered by name in [`StudyLoaders`]; the
//! [`SingleStudyLoader`] runs a session to completion on whatever thread it is
//! called from and hands back a [`LoadedStudy`] without touching shared state.

use std::sync::Arc;

use anyhow::Result;

use crate::error::{LoadOutcome, LoadStudyError};
use crate::study::{Sop, StudyRepository};

pub const AVAILABILITY_OFFLINE: &str = "OFFLINE";
pub const AVAILABILITY_NEARLINE: &str = "NEARLINE";

/// Identity and query metadata of a study that can be loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudyItem {
    pub study_instance_uid: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    /// Server the study lives on, if the loader distinguishes servers.
    pub server: Option<String>,
    pub loader_name: String,
    /// Availability status as reported by the query (ONLINE, NEARLINE, ...).
    pub instance_availability: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStudyOptions {
    /// Refuse studies the query already reported as offline or nearline.
    pub online_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStudyArgs {
    pub study_instance_uid: String,
    pub server: Option<String>,
    pub loader_name: String,
    pub instance_availability: Option<String>,
    pub options: LoadStudyOptions,
}

impl LoadStudyArgs {
    pub fn new(study_instance_uid: impl Into<String>, loader_name: impl Into<String>) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            server: None,
            loader_name: loader_name.into(),
            instance_availability: None,
            options: LoadStudyOptions::default(),
        }
    }

    pub fn for_item(item: &StudyItem, options: LoadStudyOptions) -> Self {
        Self {
            study_instance_uid: item.study_instance_uid.clone(),
            server: item.server.clone(),
            loader_name: item.loader_name.clone(),
            instance_availability: item.instance_availability.clone(),
            options,
        }
    }
}

/// One loading session.
pub trait StudyLoader: Send {
    fn name(&self) -> &str;

    /// Begins loading and returns how many sops the study is expected to have.
    fn start(&mut self, args: &LoadStudyArgs) -> Result<usize, LoadStudyError>;

    /// Next sop, or `None` once the study is exhausted. An error only affects
    /// the one sop being read.
    fn load_next_sop(&mut self) -> Result<Option<Sop>>;
}

/// Background work a loader may want once its studies are in the viewer.
pub trait PrefetchingStrategy: Send {
    fn start(&mut self, repository: &StudyRepository);
    fn stop(&mut self);
}

pub trait StudyLoaderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create_loader(&self) -> Box<dyn StudyLoader>;

    fn create_prefetching_strategy(&self) -> Option<Box<dyn PrefetchingStrategy>> {
        None
    }
}

/// Registry of loader factories, looked up by loader name.
#[derive(Clone, Default)]
pub struct StudyLoaders {
    factories: Vec<Arc<dyn StudyLoaderFactory>>,
}

impl StudyLoaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn StudyLoaderFactory>) {
        self.factories
            .retain(|existing| existing.name() != factory.name());
        self.factories.push(factory);
    }

    pub fn with(mut self, factory: Arc<dyn StudyLoaderFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn is_supported(&self, loader_name: &str) -> bool {
        self.factory(loader_name).is_some()
    }

    pub fn create_loader(&self, loader_name: &str) -> Option<Box<dyn StudyLoader>> {
        self.factory(loader_name)
            .map(|factory| factory.create_loader())
    }

    pub fn create_prefetching_strategy(
        &self,
        loader_name: &str,
    ) -> Option<Box<dyn PrefetchingStrategy>> {
        self.factory(loader_name)
            .and_then(|factory| factory.create_prefetching_strategy())
    }

    fn factory(&self, loader_name: &str) -> Option<&Arc<dyn StudyLoaderFactory>> {
        self.factories
            .iter()
            .find(|factory| factory.name() == loader_name)
    }
}

/// Sops of one study, loaded but not yet applied anywhere.
#[derive(Debug)]
pub struct LoadedStudy {
    pub args: LoadStudyArgs,
    pub loader_name: String,
    pub sops: Vec<Sop>,
    pub total: usize,
    pub failed: usize,
}

/// What happened when a loaded study was handed to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The study was already present and error-free; the sops were dropped.
    Redundant,
    Added { added: usize },
}

impl LoadedStudy {
    pub fn study_instance_uid(&self) -> &str {
        &self.args.study_instance_uid
    }

    pub fn outcome(&self) -> LoadOutcome {
        LoadOutcome::Loaded {
            total: self.total,
            failed: self.failed,
        }
    }

    /// The partial-load error, if any sop failed.
    pub fn error(&self) -> Option<LoadStudyError> {
        (self.failed > 0).then(|| {
            LoadStudyError::load_failed(self.args.study_instance_uid.clone(), self.total, self.failed)
        })
    }

    /// Moves the sops into the repository. Must run on the owner thread.
    pub fn apply_to(self, repository: &mut StudyRepository) -> ApplyOutcome {
        let study_uid = self.args.study_instance_uid.clone();
        if repository.contains_complete_study(&study_uid) {
            return ApplyOutcome::Redundant;
        }

        let error = self.error();
        let added = repository.add_sops(self.sops);
        repository.set_load_error(&study_uid, error);
        ApplyOutcome::Added { added }
    }
}

/// Loads exactly one study through the registry.
pub struct SingleStudyLoader<'a> {
    loaders: &'a StudyLoaders,
    args: LoadStudyArgs,
}

impl<'a> SingleStudyLoader<'a> {
    pub fn new(loaders: &'a StudyLoaders, args: LoadStudyArgs) -> Self {
        Self { loaders, args }
    }

    pub fn load(self) -> Result<LoadedStudy, LoadStudyError> {
        let study_uid = self.args.study_instance_uid.clone();

        let mut loader = self.loaders.create_loader(&self.args.loader_name).ok_or_else(|| {
            LoadStudyError::LoaderNotFound {
                study_uid: study_uid.clone(),
                loader: self.args.loader_name.clone(),
            }
        })?;

        if self.args.options.online_only {
            check_online(&study_uid, self.args.instance_availability.as_deref())?;
        }

        let expected = loader.start(&self.args)?;
        if expected == 0 {
            return Err(LoadStudyError::NotFound { study_uid });
        }

        let mut sops = Vec::with_capacity(expected);
        let mut failed_items = 0usize;
        loop {
            match loader.load_next_sop() {
                Ok(Some(sop)) => sops.push(sop),
                Ok(None) => break,
                Err(err) => {
                    failed_items += 1;
                    log::debug!("Failed to load a sop of study {study_uid}: {err:#}");
                    if failed_items >= expected {
                        break;
                    }
                }
            }
        }

        let total = expected.max(sops.len() + failed_items);
        let failed = total - sops.len();
        if sops.is_empty() {
            log::error!("All {total} sops of study {study_uid} failed to load");
            return Err(LoadStudyError::load_failed(study_uid, total, total));
        }

        Ok(LoadedStudy {
            loader_name: loader.name().to_string(),
            args: self.args,
            sops,
            total,
            failed,
        })
    }
}

fn check_online(study_uid: &str, availability: Option<&str>) -> Result<(), LoadStudyError> {
    let Some(availability) = availability else {
        return Ok(());
    };
    let status = availability.trim();
    if status.eq_ignore_ascii_case(AVAILABILITY_OFFLINE) {
        return Err(LoadStudyError::Offline {
            study_uid: study_uid.to_string(),
        });
    }
    if status.eq_ignore_ascii_case(AVAILABILITY_NEARLINE) {
        return Err(LoadStudyError::Nearline {
            study_uid: study_uid.to_string(),
            being_restored: false,
        });
    }
    Ok(())
}
