//! Whole-cohort batch processing.
//!
//! For every patient in the cohort, each configured series pattern is
//! searched and retrieved; received files are optionally pseudonymized in
//! place, and one final sort pass moves everything out of the transit tree.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use snafu::{Report, ResultExt, Snafu};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::OutputLayout;
use crate::criteria::SearchCriteria;
use crate::pseudonym::{pseudonymize_obj, PseudonymStore};
use crate::retrieve::QueryRetrieve;
use crate::sort::{GlobalSortEngine, SortSummary};

/// File next to the output tree holding the identity → pseudonym table.
pub const MAPPING_FILENAME: &str = "pseudonym_mapping.csv";

/// Series description patterns fetched for every patient when the caller
/// does not supply their own catalog.
pub const DEFAULT_SERIES_PATTERNS: &[&str] = &[
    "VIBE_3TE CUISSES",
    "VIBE_3TE JAMBES",
    "T2mapping 2D TRA 17Echos CUISSES",
    "T2mapping 2D TRA 17Echos JAMBES",
];

#[derive(Debug, Snafu)]
pub enum Error {
    /// A background task panicked or was cancelled
    TaskPanicked { source: tokio::task::JoinError },

    #[snafu(display("could not create output directory {}: {source}", path.display()))]
    CreateOutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Counters shared across all workers of one batch.
#[derive(Debug, Default)]
pub struct TransferStats {
    patients: AtomicU32,
    series: AtomicU32,
    files: AtomicU32,
    errors: AtomicU32,
    pseudonymized: AtomicU32,
    pseudonymization_errors: AtomicU32,
}

impl TransferStats {
    pub fn inc_patients(&self) {
        self.patients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_series(&self) {
        self.series.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_files(&self, n: u32) {
        self.files.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pseudonymized(&self) {
        self.pseudonymized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pseudonymization_errors(&self) {
        self.pseudonymization_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            patients: self.patients.load(Ordering::Relaxed),
            series: self.series.load(Ordering::Relaxed),
            files: self.files.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pseudonymized: self.pseudonymized.load(Ordering::Relaxed),
            pseudonymization_errors: self.pseudonymization_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub patients: u32,
    /// Series retrieved without error.
    pub series: u32,
    /// Instances the archive reports as transferred.
    pub files: u32,
    /// Failed retrieval attempts. Together with `series` this accounts
    /// for every retrieval that was issued.
    pub errors: u32,
    pub pseudonymized: u32,
    pub pseudonymization_errors: u32,
}

/// Tuning knobs for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Patients processed concurrently.
    pub patient_workers: usize,
    /// Series retrievals in flight across the whole batch.
    pub series_workers: usize,
    /// Rewrite received files with pseudonyms before the sort pass.
    pub pseudonymize: bool,
    /// Concurrent file rewrites during the pseudonymization pass.
    pub pseudonym_workers: usize,
    /// Series description patterns searched per patient.
    pub series_patterns: Vec<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            patient_workers: 2,
            series_workers: 4,
            pseudonymize: false,
            pseudonym_workers: 4,
            series_patterns: DEFAULT_SERIES_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Outcome of [`BatchCoordinator::run`].
#[derive(Debug, Clone, Copy)]
pub struct BatchSummary {
    pub stats: StatsSnapshot,
    /// `None` when the final sort pass itself failed; the transit tree is
    /// left in place in that case.
    pub sort: Option<SortSummary>,
}

/// Drives search, retrieval, pseudonymization and the final sort for a
/// list of patients.
pub struct BatchCoordinator {
    backend: Arc<dyn QueryRetrieve>,
    layout: OutputLayout,
    options: BatchOptions,
    stats: Arc<TransferStats>,
    pseudonyms: Option<Arc<PseudonymStore>>,
}

impl BatchCoordinator {
    pub fn new(backend: Arc<dyn QueryRetrieve>, layout: OutputLayout, options: BatchOptions) -> Self {
        BatchCoordinator {
            backend,
            layout,
            options,
            stats: Arc::new(TransferStats::default()),
            pseudonyms: None,
        }
    }

    /// Use an existing mapping store instead of the default one under the
    /// output directory.
    pub fn with_pseudonym_store(mut self, store: Arc<PseudonymStore>) -> Self {
        self.pseudonyms = Some(store);
        self
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// Process the whole cohort. A failed retrieval is counted and logged
    /// but never stops the remaining work.
    pub async fn run(&self, patients: &[String]) -> Result<BatchSummary, Error> {
        std::fs::create_dir_all(self.layout.output_dir()).context(CreateOutputDirSnafu {
            path: self.layout.output_dir().to_path_buf(),
        })?;
        info!(
            patients = patients.len(),
            patterns = self.options.series_patterns.len(),
            "starting batch"
        );

        let patient_semaphore = Arc::new(Semaphore::new(self.options.patient_workers));
        let series_semaphore = Arc::new(Semaphore::new(self.options.series_workers));

        let mut tasks = JoinSet::new();
        for patient_id in patients {
            let backend = Arc::clone(&self.backend);
            let stats = Arc::clone(&self.stats);
            let patient_semaphore = Arc::clone(&patient_semaphore);
            let series_semaphore = Arc::clone(&series_semaphore);
            let patterns = self.options.series_patterns.clone();
            let pseudonymize = self.options.pseudonymize;
            let patient_id = patient_id.clone();

            tasks.spawn(async move {
                let _permit = match patient_semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                info!(patient = %patient_id, "processing patient");
                stats.inc_patients();

                let mut series_tasks = JoinSet::new();
                for pattern in patterns {
                    let backend = Arc::clone(&backend);
                    let stats = Arc::clone(&stats);
                    let series_semaphore = Arc::clone(&series_semaphore);
                    let patient_id = patient_id.clone();

                    series_tasks.spawn(async move {
                        let _permit = match series_semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let mut criteria = SearchCriteria::series(&patient_id, &pattern);
                        criteria.pseudonymize = pseudonymize;

                        let matches = backend.search(&criteria).await;
                        if matches.is_empty() {
                            debug!(patient = %patient_id, pattern, "no matching series");
                            return;
                        }
                        for record in matches {
                            let (Some(study_uid), Some(series_uid)) = (
                                record.study_instance_uid.clone(),
                                record.series_instance_uid.clone(),
                            ) else {
                                warn!(patient = %patient_id, pattern, "match without UIDs, skipping");
                                continue;
                            };
                            let retrieval = criteria.retrieval_for(study_uid, series_uid);
                            match backend.retrieve(&retrieval).await {
                                Ok(count) => {
                                    stats.inc_series();
                                    stats.add_files(count);
                                }
                                Err(e) => {
                                    warn!(
                                        patient = %patient_id,
                                        pattern,
                                        "retrieval failed: {}",
                                        Report::from_error(e)
                                    );
                                    stats.inc_errors();
                                }
                            }
                        }
                    });
                }
                while let Some(result) = series_tasks.join_next().await {
                    if let Err(e) = result {
                        warn!("series task failed: {e}");
                    }
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.context(TaskPanickedSnafu)?;
        }

        if self.options.pseudonymize {
            let store = self.pseudonyms.clone().unwrap_or_else(|| {
                Arc::new(PseudonymStore::new(
                    self.layout.output_dir().join(MAPPING_FILENAME),
                ))
            });
            self.pseudonymize_transit(store).await;
        }

        let engine = GlobalSortEngine::new(self.layout.clone());
        let sort = tokio::task::spawn_blocking(move || engine.finalize_sort())
            .await
            .context(TaskPanickedSnafu)?;
        let sort = match sort {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!("final sort failed: {}", Report::from_error(e));
                None
            }
        };

        let snapshot = self.stats.snapshot();
        info!(
            patients = snapshot.patients,
            series = snapshot.series,
            files = snapshot.files,
            errors = snapshot.errors,
            "batch finished"
        );
        Ok(BatchSummary {
            stats: snapshot,
            sort,
        })
    }

    /// Rewrite every staged file with a pseudonym. A file that cannot be
    /// read or rewritten is logged and left as-is for the sort pass.
    async fn pseudonymize_transit(&self, store: Arc<PseudonymStore>) {
        let transit_dir = self.layout.transit_dir();
        let files: Vec<PathBuf> = WalkDir::new(&transit_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        info!(count = files.len(), "pseudonymizing received files");

        let semaphore = Arc::new(Semaphore::new(self.options.pseudonym_workers));
        let mut tasks = JoinSet::new();
        for path in files {
            let store = Arc::clone(&store);
            let stats = Arc::clone(&self.stats);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let mut obj = match dicom_object::open_file(&path) {
                    Ok(obj) => obj,
                    Err(e) => {
                        warn!(file = %path.display(), "skipping unreadable file: {e}");
                        return;
                    }
                };
                if let Err(e) = pseudonymize_obj(&store, &mut obj).await {
                    warn!(file = %path.display(), "could not pseudonymize: {}", Report::from_error(e));
                    stats.inc_pseudonymization_errors();
                    return;
                }
                match obj.write_to_file(&path) {
                    Ok(()) => stats.inc_pseudonymized(),
                    Err(e) => {
                        warn!(file = %path.display(), "could not rewrite file: {e}");
                        stats.inc_pseudonymization_errors();
                    }
                }
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("pseudonymization task failed: {e}");
            }
        }
    }
}
