//! Retrieval orchestration: pairing C-FIND matches with C-MOVE requests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use snafu::{Report, ResultExt, Snafu};
use tracing::{info, warn};

use crate::config::PacsNodeConfig;
use crate::criteria::{QueryLevel, SearchCriteria};
use crate::findscu::{self, MatchRecord};
use crate::movescu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The C-MOVE control channel failed
    Move { source: movescu::Error },

    /// The archive reported an unsuccessful retrieval
    #[snafu(display(
        "retrieval finished with status {status:04X}H ({failed} failed sub-operations)"
    ))]
    RetrieveFailed { status: u16, failed: u16 },
}

/// The query/retrieve surface the batch coordinator drives.
///
/// Splitting this from the network code lets whole-batch behavior be
/// exercised against an in-memory archive.
#[async_trait]
pub trait QueryRetrieve: Send + Sync {
    /// Query the archive. Failures degrade to an empty result set so that
    /// one bad query never takes the batch down.
    async fn search(&self, criteria: &SearchCriteria) -> Vec<MatchRecord>;

    /// Retrieve everything the criteria select and return the number of
    /// instances the archive reports as transferred.
    async fn retrieve(&self, criteria: &SearchCriteria) -> Result<u32, Error>;
}

/// Production implementation backed by the C-FIND and C-MOVE clients.
pub struct RetrievalOrchestrator {
    config: PacsNodeConfig,
    destination_aet: String,
    files_received: Arc<AtomicU32>,
}

impl RetrievalOrchestrator {
    /// `destination_aet` must be the AE title of a running C-STORE
    /// listener; `files_received` is that listener's arrival counter.
    pub fn new(
        config: PacsNodeConfig,
        destination_aet: impl Into<String>,
        files_received: Arc<AtomicU32>,
    ) -> Self {
        RetrievalOrchestrator {
            config,
            destination_aet: destination_aet.into(),
            files_received,
        }
    }

    pub fn files_received(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.files_received)
    }
}

#[async_trait]
impl QueryRetrieve for RetrievalOrchestrator {
    async fn search(&self, criteria: &SearchCriteria) -> Vec<MatchRecord> {
        match findscu::search(&self.config, criteria).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!("search failed: {}", Report::from_error(e));
                Vec::new()
            }
        }
    }

    async fn retrieve(&self, criteria: &SearchCriteria) -> Result<u32, Error> {
        // a C-MOVE without concrete UIDs would match nothing useful, or
        // far too much
        if criteria.study_instance_uid.as_deref().unwrap_or("").is_empty() {
            warn!("skipping retrieval without a study instance UID");
            return Ok(0);
        }
        if criteria.level == QueryLevel::Series
            && criteria.series_instance_uid.as_deref().unwrap_or("").is_empty()
        {
            warn!("skipping series retrieval without a series instance UID");
            return Ok(0);
        }

        // count arrivals at the listener for this exchange
        self.files_received.store(0, Ordering::Relaxed);
        let summary = movescu::run_move(&self.config, &self.destination_aet, criteria)
            .await
            .context(MoveSnafu)?;
        if !summary.is_success() {
            return RetrieveFailedSnafu {
                status: summary.status,
                failed: summary.failed,
            }
            .fail();
        }
        let received = self.files_received.load(Ordering::Relaxed);
        if u32::from(summary.completed) != received {
            warn!(
                completed = summary.completed,
                received, "archive accounting disagrees with arrival count"
            );
        }
        info!(
            received,
            study = criteria.study_instance_uid.as_deref().unwrap_or(""),
            "retrieval finished"
        );
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            PacsNodeConfig::new("127.0.0.1", 1),
            "HARVEST-SCU",
            Arc::new(AtomicU32::new(0)),
        )
    }

    #[tokio::test]
    async fn retrieval_without_study_uid_is_skipped() {
        let criteria = SearchCriteria::series("PAT1", "T2map");
        // no UIDs resolved yet, must not even try to connect
        assert_eq!(orchestrator().retrieve(&criteria).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn series_retrieval_without_series_uid_is_skipped() {
        let mut criteria = SearchCriteria::series("PAT1", "T2map");
        criteria.study_instance_uid = Some("1.2.3".into());
        assert_eq!(orchestrator().retrieve(&criteria).await.unwrap(), 0);
    }
}
