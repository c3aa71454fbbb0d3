//! Read/write contracts against the relational store. Only the contract
//! matters here; the store itself is an external collaborator. In-memory
//! implementations back the demo deployment and the test suites.

use thiserror::Error;
use uuid::Uuid;

use crate::params::StoredParameter;
use crate::scoring::canonical::{AccountId, Period, RawAggregateRow};
use crate::scoring::engine::ScoreOutput;
use crate::scoring::risk::RiskRow;

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("batch write rejected: {0}")]
    BatchRejected(String),
    #[error("write rejected for account {account_id}: {reason}")]
    RowRejected { account_id: String, reason: String },
}

/// Read-only source of monthly aggregate rows.
pub trait AggregateRepository: Send + Sync {
    fn rows_for_period(&self, period: Period) -> Result<Vec<RawAggregateRow>, StoreError>;

    fn rows_for_sector(
        &self,
        period: Period,
        sector: &str,
    ) -> Result<Vec<RawAggregateRow>, StoreError>;

    /// Rows for a period, optionally restricted to a sector list. `None`
    /// means the whole population.
    fn rows_for_scope(
        &self,
        period: Period,
        sectors: Option<&[String]>,
    ) -> Result<Vec<RawAggregateRow>, StoreError>;
}

/// Persisted potential scores, unique on `(account_id, period)`.
pub trait ScoreRepository: Send + Sync {
    fn upsert_batch(&self, rows: &[ScoreOutput]) -> Result<(), StoreError>;
    fn upsert_one(&self, row: &ScoreOutput) -> Result<(), StoreError>;
    fn delete_for_period(
        &self,
        period: Period,
        sectors: Option<&[String]>,
    ) -> Result<usize, StoreError>;
}

/// Persisted risk rows, unique on `(account_id, period)`.
pub trait RiskRepository: Send + Sync {
    fn upsert_batch(&self, rows: &[RiskRow]) -> Result<(), StoreError>;
    fn existing_accounts(&self, period: Period) -> Result<Vec<AccountId>, StoreError>;
    fn delete_for_accounts(
        &self,
        period: Period,
        account_ids: &[AccountId],
    ) -> Result<usize, StoreError>;
}

/// Versioned coefficient rows. Reads only see `active` rows; a replace
/// soft-deletes the superseded names rather than removing them.
pub trait ParameterRepository: Send + Sync {
    fn sector_params(
        &self,
        sector: &str,
        month: &str,
        window_months: u32,
    ) -> Result<Vec<StoredParameter>, StoreError>;

    fn group_params(
        &self,
        group_id: Uuid,
        month: &str,
        window_months: u32,
    ) -> Result<Vec<StoredParameter>, StoreError>;

    fn replace_sector_params(
        &self,
        sector: &str,
        month: &str,
        window_months: u32,
        rows: Vec<StoredParameter>,
    ) -> Result<(), StoreError>;

    fn replace_group_params(
        &self,
        group_id: Uuid,
        month: &str,
        window_months: u32,
        rows: Vec<StoredParameter>,
    ) -> Result<(), StoreError>;
}

/// Named groups and their many-sectors-to-one-group membership.
pub trait SectorGroupRepository: Send + Sync {
    fn group_for_sector(&self, sector: &str) -> Result<Option<Uuid>, StoreError>;
    fn sectors_in_group(&self, group_id: Uuid) -> Result<Vec<String>, StoreError>;
    fn group_names(&self) -> Result<Vec<String>, StoreError>;

    /// Creates the named group if it does not exist; returns its id
    /// either way.
    fn upsert_group(&self, name: &str) -> Result<Uuid, StoreError>;

    /// Points each sector at the group, moving it out of any prior group.
    fn assign_sectors(&self, group_id: Uuid, sectors: &[String]) -> Result<(), StoreError>;
}
