//! Fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};

use crate::error::LoadStudyError;
use crate::finder::{PriorSearchContext, PriorStudyFinder, PriorStudyFinderResult};
use crate::loader::{
    LoadStudyArgs, PrefetchingStrategy, StudyItem, StudyLoader, StudyLoaderFactory, StudyLoaders,
};
use crate::study::{Sop, SopDataSource, SopHeader, StudyRepository};

pub const FAKE_LOADER: &str = "Fake";

pub fn header(study: &str, series: &str, sop: &str, instance_number: i32) -> SopHeader {
    SopHeader {
        study_instance_uid: study.to_string(),
        series_instance_uid: series.to_string(),
        sop_instance_uid: sop.to_string(),
        patient_id: "P1".to_string(),
        instance_number: Some(instance_number),
        is_image: true,
        ..SopHeader::default()
    }
}

pub fn prior_item(study: &str, date: &str) -> StudyItem {
    StudyItem {
        study_instance_uid: study.to_string(),
        patient_id: "P1".to_string(),
        study_date: Some(date.to_string()),
        loader_name: FAKE_LOADER.to_string(),
        ..StudyItem::default()
    }
}

/// Counts sops created through it and how many of them were dropped.
#[derive(Clone, Default)]
pub struct DropCounter {
    created: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl DropCounter {
    pub fn sop(&self, header: SopHeader) -> Sop {
        self.created.fetch_add(1, Ordering::SeqCst);
        Sop::new(Box::new(CountingSource {
            header,
            dropped: Arc::clone(&self.dropped),
        }))
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.created() - self.dropped()
    }

    pub fn wait_created(&self, count: usize) -> bool {
        wait_until(|| self.created() >= count)
    }

    pub fn wait_dropped(&self, count: usize) -> bool {
        wait_until(|| self.dropped() >= count)
    }
}

struct CountingSource {
    header: SopHeader,
    dropped: Arc<AtomicUsize>,
}

impl SopDataSource for CountingSource {
    fn header(&self) -> &SopHeader {
        &self.header
    }
}

impl Drop for CountingSource {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Blocks callers of [`Gate::wait`] until [`Gate::open`].
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

impl Gate {
    pub fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.entered += 1;
        condvar.notify_all();
        while !state.open {
            state = condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn open(&self) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.open = true;
        condvar.notify_all();
    }

    pub fn wait_entered(&self) -> bool {
        let (lock, _) = &*self.inner;
        wait_until(|| {
            lock.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entered
                > 0
        })
    }
}

#[derive(Clone)]
pub enum ItemScript {
    Sop(SopHeader),
    Fail,
}

/// What the fake loader does for one study uid.
#[derive(Clone, Default)]
pub struct StudyScript {
    pub total: usize,
    pub items: Vec<ItemScript>,
    pub start_error: Option<LoadStudyError>,
    /// Held inside `start` until opened.
    pub gate: Option<Gate>,
}

impl StudyScript {
    /// `count` image sops in one series, uids derived from the study uid.
    pub fn images(study: &str, count: usize) -> Self {
        Self::series(study, &[count])
    }

    /// One series per entry, each with that many image sops.
    pub fn series(study: &str, counts: &[usize]) -> Self {
        let mut items = Vec::new();
        for (series_index, count) in counts.iter().enumerate() {
            let series = format!("{study}.se{}", series_index + 1);
            for instance in 1..=*count {
                let sop = if counts.len() == 1 {
                    format!("{study}.{instance}")
                } else {
                    format!("{series}.{instance}")
                };
                let mut header = header(study, &series, &sop, instance as i32);
                header.series_number = Some(series_index as i32 + 1);
                items.push(ItemScript::Sop(header));
            }
        }
        Self {
            total: items.len(),
            items,
            ..Self::default()
        }
    }

    pub fn dated(mut self, date: &str) -> Self {
        for item in &mut self.items {
            if let ItemScript::Sop(header) = item {
                header.study_date = Some(date.to_string());
            }
        }
        self
    }
}

type Scripts = Arc<Mutex<HashMap<String, StudyScript>>>;

/// Registry of one scripted loader plus counters for what it did.
#[derive(Clone, Default)]
pub struct FakeLoaders {
    scripts: Scripts,
    pub counter: DropCounter,
    starts: Arc<AtomicUsize>,
    prefetch_starts: Arc<AtomicUsize>,
    prefetch_stops: Arc<AtomicUsize>,
}

impl FakeLoaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, study: &str, script: StudyScript) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(study.to_string(), script);
    }

    pub fn registry(&self) -> StudyLoaders {
        StudyLoaders::new().with(Arc::new(self.clone()))
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn prefetch_starts(&self) -> usize {
        self.prefetch_starts.load(Ordering::SeqCst)
    }

    pub fn prefetch_stops(&self) -> usize {
        self.prefetch_stops.load(Ordering::SeqCst)
    }
}

impl StudyLoaderFactory for FakeLoaders {
    fn name(&self) -> &str {
        FAKE_LOADER
    }

    fn create_loader(&self) -> Box<dyn StudyLoader> {
        Box::new(FakeLoader {
            fakes: self.clone(),
            pending: VecDeque::new(),
        })
    }

    fn create_prefetching_strategy(&self) -> Option<Box<dyn PrefetchingStrategy>> {
        Some(Box::new(FakePrefetch {
            starts: Arc::clone(&self.prefetch_starts),
            stops: Arc::clone(&self.prefetch_stops),
        }))
    }
}

struct FakeLoader {
    fakes: FakeLoaders,
    pending: VecDeque<ItemScript>,
}

impl StudyLoader for FakeLoader {
    fn name(&self) -> &str {
        FAKE_LOADER
    }

    fn start(&mut self, args: &LoadStudyArgs) -> Result<usize, LoadStudyError> {
        self.fakes.starts.fetch_add(1, Ordering::SeqCst);
        let script = self
            .fakes
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&args.study_instance_uid)
            .cloned()
            .unwrap_or_default();

        if let Some(gate) = &script.gate {
            gate.wait();
        }
        if let Some(error) = script.start_error {
            return Err(error);
        }
        self.pending = script.items.into();
        Ok(script.total)
    }

    fn load_next_sop(&mut self) -> Result<Option<Sop>> {
        match self.pending.pop_front() {
            Some(ItemScript::Sop(header)) => Ok(Some(self.fakes.counter.sop(header))),
            Some(ItemScript::Fail) => Err(anyhow!("scripted sop failure")),
            None => Ok(None),
        }
    }
}

struct FakePrefetch {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl PrefetchingStrategy for FakePrefetch {
    fn start(&mut self, _repository: &StudyRepository) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Finder returning a fixed result, optionally failing or held on a gate.
#[derive(Clone, Default)]
pub struct ScriptedFinder {
    pub studies: Vec<StudyItem>,
    pub results_complete: bool,
    pub fail: bool,
    pub gate: Option<Gate>,
    cancelled: Arc<AtomicBool>,
    searches: Arc<AtomicUsize>,
}

impl ScriptedFinder {
    pub fn returning(studies: Vec<StudyItem>) -> Self {
        Self {
            studies,
            results_complete: true,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn incomplete(mut self) -> Self {
        self.results_complete = false;
        self
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

impl PriorStudyFinder for ScriptedFinder {
    fn find_prior_studies(&self, _context: &PriorSearchContext) -> Result<PriorStudyFinderResult> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self.fail {
            bail!("scripted search failure");
        }
        Ok(PriorStudyFinderResult {
            studies: self.studies.clone(),
            results_complete: self.results_complete,
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.open();
        }
    }
}
