//! Compute capacity accounting.

mod ledger;
mod spec;
mod usage;

pub use ledger::{LedgerSnapshot, ResourceLedger};
pub use spec::{ComputeSpec, Dimension, ResourceUnit};
pub use usage::{ResourceMeasurement, ResourceUsageReport, USAGE_HISTORY_LEN, UsageHistory};
