#![deny(clippy::all)]

pub mod batch;
pub mod config;
pub mod criteria;
pub mod findscu;
pub mod movescu;
pub mod pseudonym;
pub mod retrieve;
pub mod sort;
pub mod storescp;
pub mod utils;

pub use batch::{BatchCoordinator, BatchOptions, TransferStats};
pub use config::{OutputLayout, PacsNodeConfig, SeriesLayout};
pub use criteria::{QueryLevel, SearchCriteria};
pub use pseudonym::PseudonymStore;
pub use retrieve::{QueryRetrieve, RetrievalOrchestrator};
pub use sort::GlobalSortEngine;
pub use storescp::{InstanceSink, StoreScp, StoreScpHandle};
