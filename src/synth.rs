//! Writes small synthetic DICOM studies to disk, for tests and for seeding a
//! local store to try the viewer against.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";
const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
const MATRIX: u16 = 8;

#[derive(Debug, Clone)]
pub struct SynthSeries {
    pub series_instance_uid: String,
    pub series_number: i32,
    pub modality: String,
    pub images: usize,
}

#[derive(Debug, Clone)]
pub struct SynthStudy {
    pub patient_id: String,
    pub patient_name: String,
    pub study_instance_uid: String,
    pub study_date: String,
    pub study_description: String,
    pub series: Vec<SynthSeries>,
}

impl SynthStudy {
    pub fn image_count(&self) -> usize {
        self.series.iter().map(|series| series.images).sum()
    }
}

/// Writes one file per image under `root/<study>/<series>/`.
pub fn write_study(root: &Path, study: &SynthStudy) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(study.image_count());
    for series in &study.series {
        let dir = root
            .join(&study.study_instance_uid)
            .join(&series.series_instance_uid);
        fs::create_dir_all(&dir).with_context(|| format!("Could not create {}", dir.display()))?;

        for index in 0..series.images {
            let instance_number = index + 1;
            let sop_instance_uid = format!("{}.{instance_number}", series.series_instance_uid);
            let path = dir.join(format!("{instance_number:04}.dcm"));
            let obj = image_object(study, series, &sop_instance_uid, instance_number)
                .with_meta(
                    FileMetaTableBuilder::new()
                        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
                        .media_storage_sop_class_uid(SECONDARY_CAPTURE)
                        .media_storage_sop_instance_uid(sop_instance_uid.as_str()),
                )
                .with_context(|| format!("Could not build file meta for {sop_instance_uid}"))?;
            obj.write_to_file(&path)
                .with_context(|| format!("Could not write {}", path.display()))?;
            written.push(path);
        }
    }
    log::debug!(
        "Wrote {} images for study {}",
        written.len(),
        study.study_instance_uid
    );
    Ok(written)
}

fn image_object(
    study: &SynthStudy,
    series: &SynthSeries,
    sop_instance_uid: &str,
    instance_number: usize,
) -> InMemDicomObject {
    let pixels = (0..usize::from(MATRIX) * usize::from(MATRIX))
        .map(|i| ((i * 7 + instance_number * 31) % 256) as u8)
        .collect::<Vec<_>>();

    InMemDicomObject::from_element_iter([
        text(Tag(0x0008, 0x0016), VR::UI, SECONDARY_CAPTURE),
        text(Tag(0x0008, 0x0018), VR::UI, sop_instance_uid),
        text(Tag(0x0008, 0x0020), VR::DA, &study.study_date),
        text(Tag(0x0008, 0x0060), VR::CS, &series.modality),
        text(Tag(0x0008, 0x1030), VR::LO, &study.study_description),
        text(Tag(0x0010, 0x0010), VR::PN, &study.patient_name),
        text(Tag(0x0010, 0x0020), VR::LO, &study.patient_id),
        text(Tag(0x0020, 0x000D), VR::UI, &study.study_instance_uid),
        text(Tag(0x0020, 0x000E), VR::UI, &series.series_instance_uid),
        text(Tag(0x0020, 0x0011), VR::IS, &series.series_number.to_string()),
        text(Tag(0x0020, 0x0013), VR::IS, &instance_number.to_string()),
        DataElement::new(Tag(0x0028, 0x0002), VR::US, PrimitiveValue::from(1_u16)),
        text(Tag(0x0028, 0x0004), VR::CS, "MONOCHROME2"),
        DataElement::new(Tag(0x0028, 0x0010), VR::US, PrimitiveValue::from(MATRIX)),
        DataElement::new(Tag(0x0028, 0x0011), VR::US, PrimitiveValue::from(MATRIX)),
        DataElement::new(Tag(0x0028, 0x0100), VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(Tag(0x0028, 0x0101), VR::US, PrimitiveValue::from(8_u16)),
        DataElement::new(Tag(0x0028, 0x0102), VR::US, PrimitiveValue::from(7_u16)),
        DataElement::new(Tag(0x0028, 0x0103), VR::US, PrimitiveValue::from(0_u16)),
        DataElement::new(Tag(0x7FE0, 0x0010), VR::OB, PrimitiveValue::from(pixels)),
    ])
}

fn text(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, vr, PrimitiveValue::from(value))
}

/// A current study and two priors for one patient plus an unrelated patient.
pub fn demo_studies() -> Vec<SynthStudy> {
    let study = |uid: &str, patient: &str, date: &str, description: &str, images: &[usize]| {
        SynthStudy {
            patient_id: patient.to_string(),
            patient_name: format!("{patient}^Demo"),
            study_instance_uid: uid.to_string(),
            study_date: date.to_string(),
            study_description: description.to_string(),
            series: images
                .iter()
                .enumerate()
                .map(|(index, images)| SynthSeries {
                    series_instance_uid: format!("{uid}.{}", index + 1),
                    series_number: index as i32 + 1,
                    modality: "OT".to_string(),
                    images: *images,
                })
                .collect(),
        }
    };

    vec![
        study("2.25.1001", "DEMO1", "20240312", "Current", &[4, 4]),
        study("2.25.1002", "DEMO1", "20230301", "Prior", &[4, 2]),
        study("2.25.1003", "DEMO1", "20210115", "Older prior", &[3]),
        study("2.25.2001", "DEMO2", "20220808", "Other patient", &[2]),
    ]
}

pub fn write_demo_store(root: &Path) -> Result<Vec<SynthStudy>> {
    let studies = demo_studies();
    for study in &studies {
        write_study(root, study)?;
    }
    Ok(studies)
}
