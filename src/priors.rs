//! Background discovery and loading of prior studies.
//!
//! One worker thread per run: it asks the finder for candidates, loads them one
//! at a time and hands every result to the owner through [`crate::handoff`],
//! blocking until the owner has applied it. The owner polls with
//! [`PriorStudyLoader::next_handoff`] from its own loop.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::LoadStudyError;
use crate::finder::{PriorSearchContext, PriorStudyFinder};
use crate::handoff::{self, Ack, Delivery, HandoffError, HandoffReceiver, HandoffSender};
use crate::loader::{LoadStudyArgs, LoadStudyOptions, LoadedStudy, SingleStudyLoader, StudyItem, StudyLoaders};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorLoaderState {
    Idle,
    Discovering,
    Loading,
    Completing,
    Done,
}

impl PriorLoaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Discovering,
            2 => Self::Loading,
            3 => Self::Completing,
            4 => Self::Done,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Discovering => 1,
            Self::Loading => 2,
            Self::Completing => 3,
            Self::Done => 4,
        }
    }
}

/// Counts the worker knows about once a run ends. Per-study failures are
/// collected by the owner as it applies each hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorRunSummary {
    pub total_attempted: usize,
    pub find_failed: bool,
    pub find_results_complete: bool,
}

/// A unit of work posted from the worker to the owner.
#[derive(Debug)]
pub enum PriorHandoff {
    ActiveChanged(bool),
    Loaded(LoadedStudy),
    Failed {
        item: StudyItem,
        error: LoadStudyError,
    },
    Completed(PriorRunSummary),
}

impl PriorHandoff {
    pub fn describe(&self) -> String {
        match self {
            Self::ActiveChanged(active) => format!("active={active}"),
            Self::Loaded(loaded) => format!("loaded study {}", loaded.study_instance_uid()),
            Self::Failed { item, .. } => format!("failed study {}", item.study_instance_uid),
            Self::Completed(_) => "completion".to_string(),
        }
    }
}

#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    active: AtomicBool,
    state: AtomicU8,
}

impl Shared {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: PriorLoaderState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Orchestrates prior-study runs for one viewer.
pub struct PriorStudyLoader {
    finder: Arc<dyn PriorStudyFinder>,
    loaders: StudyLoaders,
    options: LoadStudyOptions,
    shared: Arc<Shared>,
    receiver: Option<HandoffReceiver<PriorHandoff>>,
    worker: Option<JoinHandle<()>>,
}

impl PriorStudyLoader {
    pub fn new(finder: Arc<dyn PriorStudyFinder>, loaders: StudyLoaders, options: LoadStudyOptions) -> Self {
        Self {
            finder,
            loaders,
            options,
            shared: Arc::new(Shared::default()),
            receiver: None,
            worker: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.finder.is_null()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PriorLoaderState {
        PriorLoaderState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// True when no worker is running. Every hand-off is acknowledged before
    /// the worker moves on, so nothing is left queued once it has exited.
    pub fn is_finished(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
    }

    /// Starts a run. Returns false when a run is already in progress or the
    /// finder is the null finder.
    pub fn start(&mut self, context: PriorSearchContext) -> bool {
        if !self.is_enabled() {
            log::debug!("Prior study search disabled");
            return false;
        }
        if !self.is_finished() {
            return false;
        }
        self.reap();

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.set_state(PriorLoaderState::Discovering);
        let (sender, receiver) = handoff::channel();
        self.receiver = Some(receiver);

        let worker = Worker {
            finder: Arc::clone(&self.finder),
            loaders: self.loaders.clone(),
            options: self.options,
            shared: Arc::clone(&self.shared),
            sender,
        };
        self.worker = Some(thread::spawn(move || worker.run(context)));
        true
    }

    /// Next pending hand-off, without blocking.
    pub fn next_handoff(&self) -> Option<(PriorHandoff, Ack)> {
        self.receiver.as_ref()?.try_recv().ok().flatten()
    }

    /// Like [`Self::next_handoff`] but waits up to `timeout` for one.
    pub fn wait_handoff(&self, timeout: Duration) -> Option<(PriorHandoff, Ack)> {
        self.receiver.as_ref()?.recv_timeout(timeout).ok().flatten()
    }

    /// Stops the current run and waits for the worker to exit.
    ///
    /// Hand-offs still queued or posted while stopping are discarded, which
    /// drops the sops they carry. Studies already applied stay where they are.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        self.finder.cancel();

        if let Some(receiver) = self.receiver.take() {
            loop {
                match receiver.recv_timeout(STOP_POLL_INTERVAL) {
                    Ok(Some((handoff, ack))) => {
                        log::debug!("Discarding prior hand-off after stop: {}", handoff.describe());
                        drop(handoff);
                        drop(ack);
                    }
                    Ok(None) => {}
                    Err(HandoffError::Closed) => break,
                }
            }
        }

        if worker.join().is_err() {
            log::error!("Prior study worker panicked");
        }
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.set_state(PriorLoaderState::Done);
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Prior study worker panicked");
            }
        }
        self.receiver = None;
    }
}

impl Drop for PriorStudyLoader {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.finder.cancel();
        // Queued hand-offs go with the receiver; a worker blocked on one sees
        // it discarded and exits at its next stop check.
        self.receiver = None;
        self.worker = None;
    }
}

struct Worker {
    finder: Arc<dyn PriorStudyFinder>,
    loaders: StudyLoaders,
    options: LoadStudyOptions,
    shared: Arc<Shared>,
    sender: HandoffSender<PriorHandoff>,
}

impl Worker {
    fn run(self, context: PriorSearchContext) {
        self.shared.active.store(true, Ordering::SeqCst);
        let summary = match self.post(PriorHandoff::ActiveChanged(true)) {
            Ok(_) => self.discover_and_load(&context),
            Err(HandoffError::Closed) => None,
        };

        self.shared.set_state(PriorLoaderState::Completing);
        if let Some(summary) = summary {
            if !self.shared.should_stop() {
                let _ = self.post(PriorHandoff::Completed(summary));
            }
        }
        self.shared.active.store(false, Ordering::SeqCst);
        let _ = self.post(PriorHandoff::ActiveChanged(false));
        self.shared.set_state(PriorLoaderState::Done);
    }

    /// Returns `None` when the owner went away mid-run.
    fn discover_and_load(&self, context: &PriorSearchContext) -> Option<PriorRunSummary> {
        let mut summary = PriorRunSummary {
            total_attempted: 0,
            find_failed: false,
            find_results_complete: true,
        };

        let found = match self.finder.find_prior_studies(context) {
            Ok(found) => found,
            Err(err) => {
                log::error!("Prior study search failed: {err:#}");
                summary.find_failed = true;
                return Some(summary);
            }
        };
        summary.find_results_complete = found.results_complete;
        if !found.results_complete {
            log::warn!("Prior study search returned incomplete results");
        }
        log::info!("Found {} prior studies", found.studies.len());

        self.shared.set_state(PriorLoaderState::Loading);
        for item in found.studies {
            if self.shared.should_stop() {
                log::debug!("Prior study loading stopped");
                break;
            }

            summary.total_attempted += 1;
            let args = LoadStudyArgs::for_item(&item, self.options);
            let handoff = match SingleStudyLoader::new(&self.loaders, args).load() {
                Ok(loaded) => {
                    log::debug!("Prior study {}: {:?}", item.study_instance_uid, loaded.outcome());
                    PriorHandoff::Loaded(loaded)
                }
                Err(error) => {
                    log::error!("Failed to load prior study {}: {error}", item.study_instance_uid);
                    PriorHandoff::Failed { item, error }
                }
            };

            if self.shared.should_stop() {
                log::debug!("Discarding {} loaded after stop", handoff.describe());
                break;
            }
            match self.post(handoff) {
                Ok(Delivery::Applied) => {}
                Ok(Delivery::Discarded) => log::debug!("Prior hand-off discarded by owner"),
                Err(HandoffError::Closed) => return None,
            }
        }
        Some(summary)
    }

    fn post(&self, handoff: PriorHandoff) -> Result<Delivery, HandoffError> {
        self.sender.post_and_wait(handoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::NullPriorStudyFinder;
    use crate::testing::{prior_item, wait_until, FakeLoaders, Gate, ScriptedFinder, StudyScript};

    const WAIT: Duration = Duration::from_secs(5);

    fn orchestrator(finder: ScriptedFinder, fakes: &FakeLoaders) -> PriorStudyLoader {
        PriorStudyLoader::new(Arc::new(finder), fakes.registry(), LoadStudyOptions::default())
    }

    /// Acknowledges every hand-off until the worker exits.
    fn apply_all(priors: &PriorStudyLoader) -> Vec<PriorHandoff> {
        let mut received = Vec::new();
        while !priors.is_finished() {
            if let Some((handoff, ack)) = priors.wait_handoff(Duration::from_millis(10)) {
                received.push(handoff);
                ack.complete();
            }
        }
        received
    }

    #[test]
    fn null_finder_never_starts() {
        let fakes = FakeLoaders::new();
        let mut priors = PriorStudyLoader::new(
            Arc::new(NullPriorStudyFinder),
            fakes.registry(),
            LoadStudyOptions::default(),
        );
        assert!(!priors.is_enabled());
        assert!(!priors.start(PriorSearchContext::default()));
        assert!(priors.is_finished());
    }

    #[test]
    fn run_posts_results_in_discovery_order() {
        let fakes = FakeLoaders::new();
        fakes.script("p1", StudyScript::images("p1", 2));
        fakes.script("p2", StudyScript::images("p2", 3));
        let finder = ScriptedFinder::returning(vec![
            prior_item("p1", "20200101"),
            prior_item("missing", "20190101"),
            prior_item("p2", "20180101"),
        ]);
        let mut priors = orchestrator(finder, &fakes);

        assert!(priors.start(PriorSearchContext::default()));
        let received = apply_all(&priors);

        let kinds = received
            .iter()
            .map(|handoff| match handoff {
                PriorHandoff::ActiveChanged(active) => format!("active:{active}"),
                PriorHandoff::Loaded(loaded) => format!("loaded:{}", loaded.study_instance_uid()),
                PriorHandoff::Failed { item, .. } => format!("failed:{}", item.study_instance_uid),
                PriorHandoff::Completed(summary) => format!("completed:{}", summary.total_attempted),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "active:true",
                "loaded:p1",
                "failed:missing",
                "loaded:p2",
                "completed:3",
                "active:false"
            ]
        );
        assert!(!priors.is_active());
        assert_eq!(priors.state(), PriorLoaderState::Done);
    }

    #[test]
    fn find_failure_is_reported_in_the_summary() {
        let fakes = FakeLoaders::new();
        let mut priors = orchestrator(ScriptedFinder::failing(), &fakes);
        priors.start(PriorSearchContext::default());

        let summary = apply_all(&priors)
            .into_iter()
            .find_map(|handoff| match handoff {
                PriorHandoff::Completed(summary) => Some(summary),
                _ => None,
            })
            .expect("completion is posted");
        assert!(summary.find_failed);
        assert_eq!(summary.total_attempted, 0);
    }

    #[test]
    fn starting_twice_while_running_is_a_noop() {
        let fakes = FakeLoaders::new();
        let gate = Gate::default();
        let finder = ScriptedFinder::returning(Vec::new()).gated(gate.clone());
        let mut priors = orchestrator(finder.clone(), &fakes);

        assert!(priors.start(PriorSearchContext::default()));
        let (_, ack) = priors.wait_handoff(WAIT).expect("active announcement");
        ack.complete();
        assert!(gate.wait_entered());
        assert!(priors.is_active());
        assert!(!priors.start(PriorSearchContext::default()));

        gate.open();
        apply_all(&priors);
        assert_eq!(finder.searches(), 1);
    }

    #[test]
    fn stop_discards_the_in_flight_study_and_skips_the_rest() {
        let fakes = FakeLoaders::new();
        fakes.script("p1", StudyScript::images("p1", 2));
        fakes.script("p2", StudyScript::images("p2", 2));
        fakes.script("p3", StudyScript::images("p3", 2));
        let finder = ScriptedFinder::returning(vec![
            prior_item("p1", "20200101"),
            prior_item("p2", "20190101"),
            prior_item("p3", "20180101"),
        ]);
        let mut priors = orchestrator(finder.clone(), &fakes);
        priors.start(PriorSearchContext::default());

        let mut applied = Vec::new();
        while applied.is_empty() {
            let (handoff, ack) = priors.wait_handoff(WAIT).expect("hand-off");
            if let PriorHandoff::Loaded(loaded) = handoff {
                applied.push(loaded);
            }
            ack.complete();
        }

        // p2 is loaded (or posted) but never acknowledged by the owner.
        assert!(fakes.counter.wait_created(4));
        priors.stop();

        assert!(priors.is_finished());
        assert!(!priors.is_active());
        assert!(finder.was_cancelled());
        assert_eq!(fakes.starts(), 2);
        assert_eq!(fakes.counter.dropped(), 2);
        assert!(priors.next_handoff().is_none());

        drop(applied);
        assert_eq!(fakes.counter.dropped(), 4);
    }

    #[test]
    fn stop_during_a_load_lets_it_finish_then_disposes_it() {
        let fakes = FakeLoaders::new();
        let gate = Gate::default();
        fakes.script("p1", StudyScript::images("p1", 1));
        fakes.script(
            "p2",
            StudyScript {
                gate: Some(gate.clone()),
                ..StudyScript::images("p2", 3)
            },
        );
        fakes.script("p3", StudyScript::images("p3", 1));
        let finder = ScriptedFinder::returning(vec![
            prior_item("p1", "20200101"),
            prior_item("p2", "20190101"),
            prior_item("p3", "20180101"),
        ]);
        let mut priors = orchestrator(finder.clone(), &fakes);
        priors.start(PriorSearchContext::default());

        let mut applied = Vec::new();
        while applied.is_empty() {
            let (handoff, ack) = priors.wait_handoff(WAIT).expect("hand-off");
            if let PriorHandoff::Loaded(loaded) = handoff {
                applied.push(loaded);
            }
            ack.complete();
        }

        // p2 is held inside start until the stop request reaches the finder.
        assert!(gate.wait_entered());
        let opener = {
            let finder = finder.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                wait_until(|| finder.was_cancelled());
                gate.open();
            })
        };
        priors.stop();
        opener.join().expect("opener thread");

        assert!(priors.is_finished());
        assert_eq!(fakes.starts(), 2);
        assert_eq!(fakes.counter.created(), 4);
        assert!(fakes.counter.wait_dropped(3));
        assert_eq!(fakes.counter.live(), 1);
        assert!(priors.next_handoff().is_none());

        drop(applied);
        assert_eq!(fakes.counter.live(), 0);
    }

    #[test]
    fn stop_after_completion_is_harmless() {
        let fakes = FakeLoaders::new();
        fakes.script("p1", StudyScript::images("p1", 1));
        let mut priors = orchestrator(
            ScriptedFinder::returning(vec![prior_item("p1", "20200101")]),
            &fakes,
        );
        priors.start(PriorSearchContext::default());
        apply_all(&priors);

        priors.stop();
        priors.stop();
        assert_eq!(priors.state(), PriorLoaderState::Done);
    }

    #[test]
    fn dropping_during_a_run_disposes_pending_results_without_blocking() {
        let fakes = FakeLoaders::new();
        fakes.script("p1", StudyScript::images("p1", 3));
        fakes.script("p2", StudyScript::images("p2", 3));
        let mut priors = orchestrator(
            ScriptedFinder::returning(vec![
                prior_item("p1", "20200101"),
                prior_item("p2", "20190101"),
            ]),
            &fakes,
        );
        priors.start(PriorSearchContext::default());
        let (_, ack) = priors.wait_handoff(WAIT).expect("active announcement");
        ack.complete();

        assert!(fakes.counter.wait_created(3));
        drop(priors);

        assert!(wait_until(|| fakes.counter.live() == 0));
        assert!(fakes.starts() <= 2);
    }
}
