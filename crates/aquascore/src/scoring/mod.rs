//! The scoring engine: canonical feature records, population binning,
//! policy evaluation, composite scoring, classification, and the batch
//! services that drive them.

pub mod bins;
pub mod canonical;
pub mod classify;
pub mod composite;
pub mod engine;
pub mod policy;
pub mod risk;
pub mod service;
