//! A directory of DICOM files served as a study store: a loader that yields
//! one sop per file and a prior finder over the other studies of a patient.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fs, io::Cursor};

use anyhow::{bail, Context, Result};
use dicom_object::{from_reader, open_file, DefaultDicomObject, ReadError};

use crate::error::LoadStudyError;
use crate::finder::{PriorSearchContext, PriorStudyFinder, PriorStudyFinderResult};
use crate::loader::{LoadStudyArgs, StudyItem, StudyLoader, StudyLoaderFactory};
use crate::study::{Sop, SopDataSource, SopHeader};

pub const LOCAL_STORE_LOADER: &str = "LocalStore";

#[derive(Debug, Clone)]
pub struct StoredStudy {
    pub item: StudyItem,
    pub files: Vec<PathBuf>,
}

/// Index of every readable DICOM file under a root directory, by study.
#[derive(Debug, Default)]
pub struct LocalStore {
    root: PathBuf,
    studies: BTreeMap<String, StoredStudy>,
    skipped: usize,
}

impl LocalStore {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }

        let mut store = Self {
            root: root.to_path_buf(),
            ..Self::default()
        };
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries =
                fs::read_dir(&dir).with_context(|| format!("Could not read {}", dir.display()))?;
            let mut paths = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .collect::<Vec<_>>();
            paths.sort();
            for path in paths {
                if path.is_dir() {
                    pending.push(path);
                } else {
                    store.index_file(path);
                }
            }
        }

        log::info!(
            "Indexed {} studies under {} ({} files skipped)",
            store.studies.len(),
            root.display(),
            store.skipped
        );
        Ok(store)
    }

    fn index_file(&mut self, path: PathBuf) {
        let header = match open_dicom_object(&path).and_then(|obj| read_header(&obj)) {
            Ok(header) => header,
            Err(err) => {
                log::warn!("Skipping {}: {err:#}", path.display());
                self.skipped += 1;
                return;
            }
        };

        self.studies
            .entry(header.study_instance_uid.clone())
            .or_insert_with(|| StoredStudy {
                item: StudyItem {
                    study_instance_uid: header.study_instance_uid.clone(),
                    patient_id: header.patient_id.clone(),
                    patient_name: header.patient_name.clone(),
                    study_date: header.study_date.clone(),
                    study_time: header.study_time.clone(),
                    study_description: header.study_description.clone(),
                    server: None,
                    loader_name: LOCAL_STORE_LOADER.to_string(),
                    instance_availability: Some("ONLINE".to_string()),
                },
                files: Vec::new(),
            })
            .files
            .push(path);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Files that could not be read as DICOM while indexing.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn studies(&self) -> impl Iterator<Item = &StoredStudy> {
        self.studies.values()
    }

    pub fn study(&self, study_instance_uid: &str) -> Option<&StoredStudy> {
        self.studies.get(study_instance_uid)
    }

    /// Most recent study first, the usual thing to open when none is named.
    pub fn latest_study(&self) -> Option<&StoredStudy> {
        self.studies
            .values()
            .max_by(|a, b| a.item.study_date.cmp(&b.item.study_date))
    }

    pub fn load_args(&self, study_instance_uid: &str) -> LoadStudyArgs {
        LoadStudyArgs::new(study_instance_uid, LOCAL_STORE_LOADER)
    }
}

/// A sop backed by one file, with the parsed object kept for display.
pub struct FileSopDataSource {
    path: PathBuf,
    header: SopHeader,
    object: DefaultDicomObject,
}

impl FileSopDataSource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object(&self) -> &DefaultDicomObject {
        &self.object
    }
}

impl SopDataSource for FileSopDataSource {
    fn header(&self) -> &SopHeader {
        &self.header
    }
}

pub struct LocalStoreLoaderFactory {
    store: Arc<LocalStore>,
}

impl LocalStoreLoaderFactory {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }
}

impl StudyLoaderFactory for LocalStoreLoaderFactory {
    fn name(&self) -> &str {
        LOCAL_STORE_LOADER
    }

    fn create_loader(&self) -> Box<dyn StudyLoader> {
        Box::new(LocalStoreLoader {
            store: Arc::clone(&self.store),
            pending: VecDeque::new(),
        })
    }
}

struct LocalStoreLoader {
    store: Arc<LocalStore>,
    pending: VecDeque<PathBuf>,
}

impl StudyLoader for LocalStoreLoader {
    fn name(&self) -> &str {
        LOCAL_STORE_LOADER
    }

    fn start(&mut self, args: &LoadStudyArgs) -> Result<usize, LoadStudyError> {
        self.pending = self
            .store
            .study(&args.study_instance_uid)
            .map(|study| study.files.iter().cloned().collect())
            .unwrap_or_default();
        Ok(self.pending.len())
    }

    fn load_next_sop(&mut self) -> Result<Option<Sop>> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let object = open_dicom_object(&path)?;
        let header = read_header(&object)
            .with_context(|| format!("Could not read header of {}", path.display()))?;
        Ok(Some(Sop::new(Box::new(FileSopDataSource {
            path,
            header,
            object,
        }))))
    }
}

/// Finds the other studies of the viewer's patients in the store.
pub struct LocalStorePriorFinder {
    store: Arc<LocalStore>,
    cancelled: AtomicBool,
}

impl LocalStorePriorFinder {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            cancelled: AtomicBool::new(false),
        }
    }
}

impl PriorStudyFinder for LocalStorePriorFinder {
    fn find_prior_studies(&self, context: &PriorSearchContext) -> Result<PriorStudyFinderResult> {
        let mut result = PriorStudyFinderResult::complete(Vec::new());
        for study in self.store.studies() {
            // Cancellation is sticky; later searches report incomplete results.
            if self.cancelled.load(Ordering::SeqCst) {
                result.results_complete = false;
                break;
            }
            let item = &study.item;
            if context.is_loaded(&item.study_instance_uid)
                || !context.patient_ids.iter().any(|id| *id == item.patient_id)
            {
                continue;
            }
            result.studies.push(item.clone());
        }
        Ok(result)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn read_header(obj: &DefaultDicomObject) -> Result<SopHeader> {
    let Some(study_instance_uid) = read_string(obj, "StudyInstanceUID") else {
        bail!("missing StudyInstanceUID");
    };
    let Some(series_instance_uid) = read_string(obj, "SeriesInstanceUID") else {
        bail!("missing SeriesInstanceUID");
    };
    let Some(sop_instance_uid) = read_string(obj, "SOPInstanceUID") else {
        bail!("missing SOPInstanceUID");
    };

    Ok(SopHeader {
        study_instance_uid,
        series_instance_uid,
        sop_instance_uid,
        patient_id: read_string(obj, "PatientID").unwrap_or_default(),
        patient_name: read_string(obj, "PatientName"),
        study_date: read_string(obj, "StudyDate"),
        study_time: read_string(obj, "StudyTime"),
        study_description: read_string(obj, "StudyDescription"),
        accession_number: read_string(obj, "AccessionNumber"),
        series_number: read_int_first(obj, "SeriesNumber"),
        series_description: read_string(obj, "SeriesDescription"),
        modality: read_string(obj, "Modality"),
        instance_number: read_int_first(obj, "InstanceNumber"),
        is_image: obj.element_by_name("PixelData").is_ok(),
    })
}

fn read_string(obj: &DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|v| v.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
        .filter(|v| !v.is_empty())
}

fn read_int_first(obj: &DefaultDicomObject, name: &str) -> Option<i32> {
    read_string(obj, name).and_then(|value| {
        value
            .split('\\')
            .next()
            .and_then(|v| v.trim().parse::<i32>().ok())
    })
}

/// Opens a file, retrying once with a synthesized (0002,0000) element when
/// the writer left the meta group length out.
fn open_dicom_object(path: &Path) -> Result<DefaultDicomObject> {
    let err = match open_file(path) {
        Ok(obj) => return Ok(obj),
        Err(err) => err,
    };
    if !lacks_meta_group_length(&err) {
        return Err(err).with_context(|| format!("Could not open {}", path.display()));
    }

    let bytes = fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    let Some(repaired) = insert_meta_group_length(&bytes) else {
        return Err(err).with_context(|| format!("Could not open {}", path.display()));
    };
    from_reader(Cursor::new(repaired)).with_context(|| {
        format!(
            "Could not open {} after adding the missing meta group length",
            path.display()
        )
    })
}

fn lacks_meta_group_length(error: &ReadError) -> bool {
    matches!(
        error,
        ReadError::ParseMetaDataSet {
            source: dicom_object::meta::Error::UnexpectedTag { tag, .. }
        } if tag.group() == 0x0002 && tag.element() != 0x0000
    )
}

fn insert_meta_group_length(bytes: &[u8]) -> Option<Vec<u8>> {
    let start = if bytes.get(128..132) == Some(b"DICM".as_slice()) {
        132
    } else if bytes.get(..4) == Some(b"DICM".as_slice()) {
        4
    } else {
        return None;
    };

    let first_tag = bytes.get(start..start + 4)?;
    let group = u16::from_le_bytes([first_tag[0], first_tag[1]]);
    let element = u16::from_le_bytes([first_tag[2], first_tag[3]]);
    if group != 0x0002 || element == 0x0000 {
        return None;
    }

    let group_length = u32::try_from(meta_group_extent(bytes, start)?).ok()?;
    let mut element = [0u8; 12];
    element[0..2].copy_from_slice(&0x0002u16.to_le_bytes());
    element[4..6].copy_from_slice(b"UL");
    element[6..8].copy_from_slice(&4u16.to_le_bytes());
    element[8..12].copy_from_slice(&group_length.to_le_bytes());

    let mut repaired = Vec::with_capacity(bytes.len() + element.len());
    repaired.extend_from_slice(&bytes[..start]);
    repaired.extend_from_slice(&element);
    repaired.extend_from_slice(&bytes[start..]);
    Some(repaired)
}

/// Byte length of the explicit-VR little-endian group 0002 elements at `start`.
fn meta_group_extent(bytes: &[u8], start: usize) -> Option<usize> {
    let mut position = start;
    while let Some(header) = bytes.get(position..position + 8) {
        if u16::from_le_bytes([header[0], header[1]]) != 0x0002 {
            break;
        }
        let (header_len, value_len) = match &header[4..6] {
            b"OB" | b"OD" | b"OF" | b"OL" | b"OW" | b"SQ" | b"UC" | b"UR" | b"UT" | b"UN" => {
                let len = bytes.get(position + 8..position + 12)?;
                let value_len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]);
                if value_len == u32::MAX {
                    return None;
                }
                (12, value_len as usize)
            }
            _ => (8, u16::from_le_bytes([header[6], header[7]]) as usize),
        };
        let next = position.checked_add(header_len)?.checked_add(value_len)?;
        if next > bytes.len() {
            return None;
        }
        position = next;
    }
    (position > start).then_some(position - start)
}
