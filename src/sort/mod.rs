//! Final sort pass over the transit staging area.
//!
//! After all retrievals have finished, the transit tree is walked once and
//! every instance is moved (not copied) into its final place under the
//! output directory, grouped by patient and optionally by series. A
//! `series_metadata.json` summary is written per patient.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use dicom_dictionary_std::tags;
use dicom_object::OpenFileOptions;
use indicatif::{ProgressBar, ProgressStyle};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

mod metadata;
pub use metadata::{SeriesMetadataCollector, SeriesRecord, METADATA_FILENAME};

use crate::config::{OutputLayout, SeriesLayout};
use crate::utils::{element_str, sanitize_component};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("could not create output directory {}: {source}", path.display()))]
    CreateOutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not serialize series metadata: {source}"))]
    EncodeMetadata { source: serde_json::Error },

    #[snafu(display("could not write series metadata {}: {source}", path.display()))]
    WriteMetadata {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of one sort pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSummary {
    /// Files moved into their final location.
    pub moved: u64,
    /// Files left behind in the transit tree (unreadable or unmovable).
    pub skipped: u64,
    pub elapsed: Duration,
}

/// Moves everything accumulated under the transit directory into the final
/// per-patient layout.
///
/// The pass is deliberately single-threaded and runs after all network
/// activity has stopped, so no file is renamed while still being written.
pub struct GlobalSortEngine {
    layout: OutputLayout,
}

impl GlobalSortEngine {
    pub fn new(layout: OutputLayout) -> Self {
        GlobalSortEngine { layout }
    }

    /// Walk the transit tree and move each readable instance into place.
    ///
    /// A file that cannot be parsed or renamed is logged and left where it
    /// is; nothing is ever deleted. Empty transit directories are removed
    /// at the end.
    pub fn finalize_sort(&self) -> Result<SortSummary, Error> {
        let started = Instant::now();
        let transit_dir = self.layout.transit_dir();
        if !transit_dir.is_dir() {
            info!("transit directory is absent, nothing to sort");
            return Ok(SortSummary {
                moved: 0,
                skipped: 0,
                elapsed: started.elapsed(),
            });
        }

        let mut skipped = 0u64;
        let mut files: Vec<(String, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&transit_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                !name.starts_with('.') && name != "Thumbs.db"
            })
        {
            let path = entry.into_path();
            match OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(&path)
            {
                Ok(obj) => {
                    let patient = sanitize_component(
                        &element_str(&obj, tags::PATIENT_NAME)
                            .or_else(|| element_str(&obj, tags::PATIENT_ID))
                            .unwrap_or_default(),
                    );
                    files.push((patient, path));
                }
                Err(e) => {
                    warn!(file = %path.display(), "skipping unreadable file: {e}");
                    skipped += 1;
                }
            }
        }
        // Sorting by (output patient, path) keeps one patient's files
        // contiguous even when they arrived under different transit
        // directories (two patient IDs sharing a display name, or a
        // pseudonymization pass mapping several IDs to one pseudonym),
        // so the collector flushes each patient exactly once.
        files.sort();

        info!(count = files.len(), "sorting received files");
        let progress_bar = ProgressBar::new(files.len() as u64);
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
                .expect("Invalid progress bar template"),
        );

        let mut moved = 0u64;
        let mut collector: Option<SeriesMetadataCollector> = None;

        for (patient, path) in &files {
            progress_bar.inc(1);

            let obj = match OpenFileOptions::new()
                .read_until(tags::PIXEL_DATA)
                .open_file(path)
            {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(file = %path.display(), "skipping unreadable file: {e}");
                    skipped += 1;
                    continue;
                }
            };

            let patient_dir = self.layout.output_dir().join(patient);

            // New patient: write out the previous one's metadata.
            let flush = collector
                .as_ref()
                .is_some_and(|c| c.patient_dir() != patient_dir);
            if flush {
                if let Some(done) = collector.take() {
                    done.save_to_json()?;
                }
            }

            let dest_dir = match self.layout.layout {
                SeriesLayout::PerSeries => {
                    let number =
                        element_str(&obj, tags::SERIES_NUMBER).unwrap_or_else(|| "0".into());
                    let description = sanitize_component(
                        &element_str(&obj, tags::SERIES_DESCRIPTION).unwrap_or_default(),
                    );
                    patient_dir.join(format!("{number}_{description}"))
                }
                SeriesLayout::FlatPatient => patient_dir.clone(),
            };
            std::fs::create_dir_all(&dest_dir).context(CreateOutputDirSnafu {
                path: dest_dir.clone(),
            })?;

            let file_name = match path.file_name() {
                Some(name) => name,
                None => {
                    skipped += 1;
                    continue;
                }
            };
            let dest = dest_dir.join(file_name);
            if let Err(e) = std::fs::rename(path, &dest) {
                warn!(file = %path.display(), "could not move file into place: {e}");
                skipped += 1;
                continue;
            }
            debug!(from = %path.display(), to = %dest.display(), "moved");

            collector
                .get_or_insert_with(|| SeriesMetadataCollector::new(&patient_dir))
                .add_instance(&obj);
            moved += 1;
        }
        if let Some(done) = collector.take() {
            done.save_to_json()?;
        }
        progress_bar.finish_and_clear();

        self.cleanup_transit();

        let summary = SortSummary {
            moved,
            skipped,
            elapsed: started.elapsed(),
        };
        info!(
            moved = summary.moved,
            skipped = summary.skipped,
            "sort pass finished in {:.2?}",
            summary.elapsed
        );
        Ok(summary)
    }

    /// Remove now-empty transit directories, deepest first. A directory
    /// that still holds skipped files simply stays.
    fn cleanup_transit(&self) {
        let transit_dir = self.layout.transit_dir();
        for entry in WalkDir::new(&transit_dir)
            .contents_first(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
        {
            let _ = std::fs::remove_dir(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::uids;
    use dicom_object::{mem::InMemDicomObject, FileMetaTableBuilder};

    fn write_instance(
        dir: &Path,
        patient: &str,
        series_number: &str,
        series_description: &str,
        sop_uid: &str,
    ) {
        write_instance_named(dir, patient, patient, series_number, series_description, sop_uid);
    }

    fn write_instance_named(
        dir: &Path,
        patient_name: &str,
        patient_id: &str,
        series_number: &str,
        series_description: &str,
        sop_uid: &str,
    ) {
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid)),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, patient_name)),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient_id)),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, dicom_value!(Str, series_number)),
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                dicom_value!(Str, series_description),
            ),
        ]);
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop_uid)
            .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .build()
            .unwrap();
        std::fs::create_dir_all(dir).unwrap();
        obj.with_exact_meta(meta)
            .write_to_file(dir.join(format!("{sop_uid}.dcm")))
            .unwrap();
    }

    #[test]
    fn sorts_into_per_series_layout_and_empties_transit() {
        let out = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(out.path());
        let transit = layout.transit_dir();

        write_instance(&transit.join("Alpha"), "Alpha", "1", "T2map", "1.1.1");
        write_instance(&transit.join("Alpha"), "Alpha", "1", "T2map", "1.1.2");
        write_instance(&transit.join("Alpha"), "Alpha", "2", "VIBE", "1.1.3");
        write_instance(&transit.join("Beta"), "Beta", "5", "T2map", "2.1.1");
        write_instance(&transit.join("Beta"), "Beta", "5", "T2map", "2.1.2");

        let summary = GlobalSortEngine::new(layout).finalize_sort().unwrap();
        assert_eq!(summary.moved, 5);
        assert_eq!(summary.skipped, 0);

        assert!(out.path().join("Alpha/1_T2map/1.1.1.dcm").is_file());
        assert!(out.path().join("Alpha/1_T2map/1.1.2.dcm").is_file());
        assert!(out.path().join("Alpha/2_VIBE/1.1.3.dcm").is_file());
        assert!(out.path().join("Beta/5_T2map/2.1.1.dcm").is_file());
        assert!(out.path().join("Beta/5_T2map/2.1.2.dcm").is_file());
        // transit is gone once everything moved out
        assert!(!transit.exists());

        let alpha: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(out.path().join("Alpha").join(METADATA_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(alpha["1_SE_T2map"]["NumberOfInstances"], 2);
        assert_eq!(alpha["2_SE_VIBE"]["NumberOfInstances"], 1);
        let beta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(out.path().join("Beta").join(METADATA_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(beta["5_SE_T2map"]["NumberOfInstances"], 2);
    }

    #[test]
    fn shared_display_name_across_transit_dirs_yields_one_metadata_file() {
        let out = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(out.path());
        let transit = layout.transit_dir();

        // two patient IDs carrying the same display name, with an
        // unrelated patient staged between them in path order
        write_instance_named(&transit.join("IDA"), "Shared", "IDA", "1", "T2map", "1.1.1");
        write_instance_named(&transit.join("IDB"), "Other", "IDB", "2", "VIBE", "2.1.1");
        write_instance_named(&transit.join("IDC"), "Shared", "IDC", "3", "T2map", "3.1.1");

        let summary = GlobalSortEngine::new(layout).finalize_sort().unwrap();
        assert_eq!(summary.moved, 3);

        assert!(out.path().join("Shared/1_T2map/1.1.1.dcm").is_file());
        assert!(out.path().join("Shared/3_T2map/3.1.1.dcm").is_file());
        assert!(out.path().join("Other/2_VIBE/2.1.1.dcm").is_file());

        // one metadata file covering both series of the shared patient
        let shared: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(out.path().join("Shared").join(METADATA_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(shared["1_SE_T2map"]["NumberOfInstances"], 1);
        assert_eq!(shared["3_SE_T2map"]["NumberOfInstances"], 1);
        let total: u64 = shared
            .as_object()
            .unwrap()
            .values()
            .map(|record| record["NumberOfInstances"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn flat_layout_drops_files_directly_under_the_patient() {
        let out = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(out.path()).with_layout(SeriesLayout::FlatPatient);
        let transit = layout.transit_dir();

        write_instance(&transit.join("Alpha"), "Alpha", "3", "T2map", "1.1.1");

        let summary = GlobalSortEngine::new(layout).finalize_sort().unwrap();
        assert_eq!(summary.moved, 1);
        assert!(out.path().join("Alpha/1.1.1.dcm").is_file());
        assert!(!out.path().join("Alpha/3_T2map").exists());
    }

    #[test]
    fn unreadable_files_are_left_in_transit() {
        let out = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(out.path());
        let transit = layout.transit_dir();

        write_instance(&transit.join("Alpha"), "Alpha", "3", "T2map", "1.1.1");
        let junk = transit.join("Alpha").join("junk.dcm");
        std::fs::write(&junk, b"not a dicom file").unwrap();

        let summary = GlobalSortEngine::new(layout).finalize_sort().unwrap();
        assert_eq!(summary.moved, 1);
        assert_eq!(summary.skipped, 1);
        // the junk file stays in place, its directory is not removed
        assert!(junk.is_file());
    }

    #[test]
    fn empty_transit_is_a_noop() {
        let out = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(out.path());
        std::fs::create_dir_all(layout.transit_dir()).unwrap();

        let summary = GlobalSortEngine::new(layout).finalize_sort().unwrap();
        assert_eq!(summary.moved, 0);
        assert_eq!(summary.skipped, 0);
    }
}
