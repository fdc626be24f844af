//! Study viewer core: loads primary studies, lays them out over a grid of
//! image boxes spanning one or more monitors, and keeps loading related
//! prior studies in the background while the user works.

pub mod error;
pub mod finder;
pub mod grid;
pub mod handoff;
pub mod launch;
pub mod loader;
pub mod local_store;
pub mod memento;
pub mod priors;
pub mod settings;
pub mod study;
pub mod viewer;
pub mod workspace;

#[cfg(any(test, feature = "dev-tools"))]
pub mod synth;
#[cfg(test)]
mod testing;

pub use error::{
    AggregateOutcome, FailureReason, LoadMultipleStudiesError, LoadOutcome, LoadStudiesError,
    LoadStudyError, WorkspaceError,
};
pub use finder::{NullPriorStudyFinder, PriorSearchContext, PriorStudyFinder, PriorStudyFinderResult};
pub use grid::{PhysicalWorkspace, Screen};
pub use loader::{LoadStudyArgs, LoadStudyOptions, StudyItem, StudyLoaderFactory, StudyLoaders};
pub use memento::Memorable;
pub use priors::{PriorLoaderState, PriorStudyLoader};
pub use study::{Sop, SopHeader, StudyRepository};
pub use viewer::{ImageViewer, ViewerEvent, ViewerOptions};
pub use workspace::{LayoutManager, LogicalWorkspace, StudyComparer, StudyDateComparer};
