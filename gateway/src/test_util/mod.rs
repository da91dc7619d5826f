//! Test helpers: an in-memory worker adapter and canned wire responses.

mod mock_worker;

pub use mock_worker::{MockWorkerAdapter, MockWorkerResponses};
