//! Production adapters for the collaborator traits

mod http;
mod local;

pub use http::{HttpPayoutWorker, HttpProofGenerator};
pub use local::{LogNotifier, StaticFeeOracle};
