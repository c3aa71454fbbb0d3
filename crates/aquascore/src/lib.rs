//! Policy-driven revenue-recovery scoring for water-utility accounts.
//!
//! The crate normalizes monthly aggregate rows into canonical feature
//! records, summarizes the population into histograms that feed an external
//! calibration service, validates the policy that comes back, and evaluates
//! every account against it: family sub-scores, a weighted composite with a
//! threshold-triggered penalty, a discrete tier, and a narrative. A parallel
//! risk variant drives the same record model through versioned, hierarchical
//! coefficients resolved per sector.

pub mod calibrate;
pub mod config;
pub mod error;
pub mod groups;
pub mod params;
pub mod scoring;
pub mod store;
pub mod telemetry;
