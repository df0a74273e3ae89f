//! Staging of received instances into the transit tree.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_object::{mem::InMemDicomObject, FileMetaTableBuilder};
use snafu::{ResultExt, Whatever};
use tracing::{debug, warn};

use crate::criteria::DeidentMode;
use crate::pseudonym::{anonymize_obj, pseudonymize_obj, PseudonymStore};
use crate::utils::{element_str, sanitize_component};

/// Writes incoming instances to `transit/<patient>/<sop_instance_uid>.dcm`
/// and counts arrivals.
///
/// One sink is shared by every association the listener accepts, so the
/// arrival counter spans the whole retrieval it is wired to.
pub struct InstanceSink {
    transit_dir: PathBuf,
    mode: DeidentMode,
    pseudonyms: Option<Arc<PseudonymStore>>,
    files_received: Arc<AtomicU32>,
}

impl InstanceSink {
    pub fn new(transit_dir: impl Into<PathBuf>) -> Self {
        InstanceSink {
            transit_dir: transit_dir.into(),
            mode: DeidentMode::None,
            pseudonyms: None,
            files_received: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Apply a de-identification step to each instance before it touches
    /// disk. `Pseudonymize` needs a mapping store to draw pseudonyms from.
    pub fn with_deident(mut self, mode: DeidentMode, store: Option<Arc<PseudonymStore>>) -> Self {
        self.mode = mode;
        self.pseudonyms = store;
        self
    }

    /// Shared handle to the arrival counter.
    pub fn files_received(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.files_received)
    }

    pub fn count(&self) -> u32 {
        self.files_received.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.files_received.store(0, Ordering::Relaxed);
    }

    /// Stage one decoded instance. The file lands under a directory named
    /// after the (sanitized) patient, keyed by SOP Instance UID, and the
    /// arrival counter is bumped once the write went through.
    pub async fn ingest(&self, mut obj: InMemDicomObject, ts: &str) -> Result<PathBuf, Whatever> {
        let sop_class_uid = obj
            .element(tags::SOP_CLASS_UID)
            .whatever_context("missing SOP Class UID")?
            .to_str()
            .whatever_context("could not retrieve SOP Class UID")?
            .trim_end_matches('\0')
            .to_string();
        let sop_instance_uid = obj
            .element(tags::SOP_INSTANCE_UID)
            .whatever_context("missing SOP Instance UID")?
            .to_str()
            .whatever_context("could not retrieve SOP Instance UID")?
            .trim_end_matches('\0')
            .to_string();

        match self.mode {
            DeidentMode::None => {}
            DeidentMode::Anonymize => anonymize_obj(&mut obj),
            DeidentMode::Pseudonymize => match &self.pseudonyms {
                Some(store) => pseudonymize_obj(store, &mut obj)
                    .await
                    .whatever_context("could not pseudonymize instance")?,
                None => warn!("pseudonymization requested but no mapping store is attached"),
            },
        }

        let patient = sanitize_component(
            &element_str(&obj, tags::PATIENT_ID)
                .or_else(|| element_str(&obj, tags::PATIENT_NAME))
                .unwrap_or_default(),
        );
        let patient_dir = self.transit_dir.join(patient);
        tokio::fs::create_dir_all(&patient_dir)
            .await
            .whatever_context("could not create transit directory")?;

        let file_meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(&sop_class_uid)
            .media_storage_sop_instance_uid(&sop_instance_uid)
            .transfer_syntax(ts)
            .build()
            .whatever_context("failed to build DICOM meta file information")?;

        let file_path = patient_dir.join(format!("{sop_instance_uid}.dcm"));
        obj.with_exact_meta(file_meta)
            .write_to_file(&file_path)
            .whatever_context("could not save DICOM file")?;

        self.files_received.fetch_add(1, Ordering::Relaxed);
        debug!(file = %file_path.display(), "instance staged");
        Ok(file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::uids;

    fn instance(patient_id: &str, sop_uid: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
            ),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid)),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient_id)),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^Jane")),
        ])
    }

    #[tokio::test]
    async fn stages_under_sanitized_patient_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstanceSink::new(dir.path());

        let path = sink
            .ingest(instance("AB:12", "1.2.3.1"), uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("AB_12").join("1.2.3.1.dcm"));
        assert!(path.is_file());
        assert_eq!(sink.count(), 1);

        sink.ingest(instance("AB:12", "1.2.3.2"), uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .await
            .unwrap();
        assert_eq!(sink.count(), 2);

        sink.reset_count();
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn anonymize_mode_strips_demographics_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstanceSink::new(dir.path()).with_deident(DeidentMode::Anonymize, None);

        let path = sink
            .ingest(instance("P1", "1.2.3.1"), uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .await
            .unwrap();

        let stored = dicom_object::open_file(path).unwrap();
        assert!(stored.element(tags::PATIENT_NAME).is_err());
        assert_eq!(
            stored.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "P1"
        );
    }

    #[tokio::test]
    async fn missing_sop_instance_uid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InstanceSink::new(dir.path());

        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
        )]);
        assert!(sink
            .ingest(obj, uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .await
            .is_err());
        assert_eq!(sink.count(), 0);
    }
}
