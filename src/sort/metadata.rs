//! Per-patient series metadata sidecar.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::mem::InMemDicomObject;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;

use crate::sort::{EncodeMetadataSnafu, Error, WriteMetadataSnafu};
use crate::utils::element_str;

pub const METADATA_FILENAME: &str = "series_metadata.json";

/// One entry per series in `series_metadata.json`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SeriesRecord {
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    #[serde(rename = "SeriesNumber")]
    pub series_number: String,
    #[serde(rename = "SeriesDescription")]
    pub series_description: String,
    #[serde(rename = "StudyInstanceUID")]
    pub study_instance_uid: String,
    #[serde(rename = "SeriesInstanceUID")]
    pub series_instance_uid: String,
    #[serde(rename = "NumberOfInstances")]
    pub number_of_instances: u32,
}

/// Accumulates series metadata for the patient currently being sorted and
/// flushes it to a JSON file in the patient's output directory.
///
/// Keys are `<series_number>_SE_<series_description>`; a `BTreeMap` keeps
/// the serialized output deterministic.
pub struct SeriesMetadataCollector {
    patient_dir: PathBuf,
    series: BTreeMap<String, SeriesRecord>,
}

impl SeriesMetadataCollector {
    pub fn new(patient_dir: impl Into<PathBuf>) -> Self {
        SeriesMetadataCollector {
            patient_dir: patient_dir.into(),
            series: BTreeMap::new(),
        }
    }

    pub fn patient_dir(&self) -> &Path {
        &self.patient_dir
    }

    /// Record one instance. The entry for its series is created on first
    /// sight and its instance count bumped on every call.
    pub fn add_instance(&mut self, obj: &InMemDicomObject) {
        let patient_id = element_str(obj, tags::PATIENT_ID).unwrap_or_else(|| "Unknown".into());
        let series_number = element_str(obj, tags::SERIES_NUMBER).unwrap_or_else(|| "0".into());
        let series_description =
            element_str(obj, tags::SERIES_DESCRIPTION).unwrap_or_else(|| "Unknown".into());
        let study_instance_uid =
            element_str(obj, tags::STUDY_INSTANCE_UID).unwrap_or_else(|| "Unknown".into());
        let series_instance_uid =
            element_str(obj, tags::SERIES_INSTANCE_UID).unwrap_or_else(|| "Unknown".into());

        let key = format!("{series_number}_SE_{series_description}");
        let record = self.series.entry(key).or_insert_with(|| SeriesRecord {
            patient_id,
            series_number,
            series_description,
            study_instance_uid,
            series_instance_uid,
            number_of_instances: 0,
        });
        record.number_of_instances += 1;
    }

    /// Total instances recorded across all series of this patient.
    pub fn instance_count(&self) -> u32 {
        self.series.values().map(|r| r.number_of_instances).sum()
    }

    /// Write the collected metadata to `series_metadata.json` in the
    /// patient directory.
    pub fn save_to_json(&self) -> Result<PathBuf, Error> {
        let json_path = self.patient_dir.join(METADATA_FILENAME);
        let body = serde_json::to_string_pretty(&self.series).context(EncodeMetadataSnafu)?;
        std::fs::write(&json_path, body).context(WriteMetadataSnafu {
            path: json_path.clone(),
        })?;
        debug!(path = %json_path.display(), "metadata saved");
        Ok(json_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn instance(series_number: &str, series_description: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, dicom_value!(Str, series_number)),
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                dicom_value!(Str, series_description),
            ),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4"),
            ),
        ])
    }

    #[test]
    fn instances_of_the_same_series_share_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = SeriesMetadataCollector::new(dir.path());

        collector.add_instance(&instance("1", "T2map"));
        collector.add_instance(&instance("1", "T2map"));
        collector.add_instance(&instance("2", "VIBE"));

        assert_eq!(collector.instance_count(), 3);

        let path = collector.save_to_json().unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["1_SE_T2map"]["NumberOfInstances"], 2);
        assert_eq!(parsed["2_SE_VIBE"]["NumberOfInstances"], 1);
        assert_eq!(parsed["1_SE_T2map"]["PatientID"], "P1");
    }
}
