//! In-memory repository implementations for the demo deployment and the
//! test suites. All of them are plain mutex-guarded maps; the score store
//! additionally supports fault injection so batch fallback paths can be
//! exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

use super::{
    AggregateRepository, ParameterRepository, RiskRepository, ScoreRepository,
    SectorGroupRepository, StoreError,
};
use crate::params::StoredParameter;
use crate::scoring::canonical::{AccountId, Period, RawAggregateRow};
use crate::scoring::engine::ScoreOutput;
use crate::scoring::risk::RiskRow;

#[derive(Default)]
pub struct InMemoryAggregates {
    rows: Mutex<Vec<RawAggregateRow>>,
}

impl InMemoryAggregates {
    pub fn push(&self, row: RawAggregateRow) {
        self.rows.lock().expect("aggregate mutex poisoned").push(row);
    }
}

impl AggregateRepository for InMemoryAggregates {
    fn rows_for_period(&self, period: Period) -> Result<Vec<RawAggregateRow>, StoreError> {
        let rows = self.rows.lock().expect("aggregate mutex poisoned");
        Ok(rows.iter().filter(|r| r.period == period).cloned().collect())
    }

    fn rows_for_sector(
        &self,
        period: Period,
        sector: &str,
    ) -> Result<Vec<RawAggregateRow>, StoreError> {
        let rows = self.rows.lock().expect("aggregate mutex poisoned");
        Ok(rows
            .iter()
            .filter(|r| r.period == period && r.sector == sector)
            .cloned()
            .collect())
    }

    fn rows_for_scope(
        &self,
        period: Period,
        sectors: Option<&[String]>,
    ) -> Result<Vec<RawAggregateRow>, StoreError> {
        let rows = self.rows.lock().expect("aggregate mutex poisoned");
        Ok(rows
            .iter()
            .filter(|r| r.period == period)
            .filter(|r| sectors.map_or(true, |list| list.iter().any(|s| *s == r.sector)))
            .cloned()
            .collect())
    }
}

/// Score store with two injectable faults: reject a whole batch once, or
/// keep rejecting one account's scored rows. Failure rows (those already
/// carrying an `error`) are always accepted so the audit path can land.
#[derive(Default)]
pub struct InMemoryScores {
    rows: Mutex<HashMap<(AccountId, Period), ScoreOutput>>,
    fail_batch: AtomicBool,
    fail_account: Mutex<Option<AccountId>>,
}

impl InMemoryScores {
    pub fn len(&self) -> usize {
        self.rows.lock().expect("score mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, account_id: AccountId, period: Period) -> Option<ScoreOutput> {
        self.rows
            .lock()
            .expect("score mutex poisoned")
            .get(&(account_id, period))
            .cloned()
    }

    pub fn set_fail_batch(&self, fail: bool) {
        self.fail_batch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_account(&self, account_id: Option<AccountId>) {
        *self.fail_account.lock().expect("score mutex poisoned") = account_id;
    }
}

impl ScoreRepository for InMemoryScores {
    fn upsert_batch(&self, rows: &[ScoreOutput]) -> Result<(), StoreError> {
        // one-shot: the retry path goes row by row
        if self.fail_batch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::BatchRejected("injected batch fault".to_string()));
        }
        let mut map = self.rows.lock().expect("score mutex poisoned");
        for row in rows {
            map.insert((row.account_id, row.period), row.clone());
        }
        Ok(())
    }

    fn upsert_one(&self, row: &ScoreOutput) -> Result<(), StoreError> {
        let failing = *self.fail_account.lock().expect("score mutex poisoned");
        if failing == Some(row.account_id) && row.error.is_none() {
            return Err(StoreError::RowRejected {
                account_id: row.account_id.to_string(),
                reason: "injected row fault".to_string(),
            });
        }
        self.rows
            .lock()
            .expect("score mutex poisoned")
            .insert((row.account_id, row.period), row.clone());
        Ok(())
    }

    fn delete_for_period(
        &self,
        period: Period,
        sectors: Option<&[String]>,
    ) -> Result<usize, StoreError> {
        let mut map = self.rows.lock().expect("score mutex poisoned");
        let before = map.len();
        map.retain(|(_, row_period), row| {
            let in_scope = *row_period == period
                && sectors.map_or(true, |list| list.iter().any(|s| *s == row.sector));
            !in_scope
        });
        Ok(before - map.len())
    }
}

#[derive(Default)]
pub struct InMemoryRisk {
    rows: Mutex<HashMap<(AccountId, Period), RiskRow>>,
}

impl InMemoryRisk {
    pub fn len(&self) -> usize {
        self.rows.lock().expect("risk mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, account_id: AccountId, period: Period) -> Option<RiskRow> {
        self.rows
            .lock()
            .expect("risk mutex poisoned")
            .get(&(account_id, period))
            .cloned()
    }

    pub fn seed(&self, row: RiskRow) {
        self.rows
            .lock()
            .expect("risk mutex poisoned")
            .insert((row.account_id, row.period), row);
    }
}

impl RiskRepository for InMemoryRisk {
    fn upsert_batch(&self, rows: &[RiskRow]) -> Result<(), StoreError> {
        let mut map = self.rows.lock().expect("risk mutex poisoned");
        for row in rows {
            map.insert((row.account_id, row.period), row.clone());
        }
        Ok(())
    }

    fn existing_accounts(&self, period: Period) -> Result<Vec<AccountId>, StoreError> {
        let map = self.rows.lock().expect("risk mutex poisoned");
        Ok(map
            .keys()
            .filter(|(_, row_period)| *row_period == period)
            .map(|(account_id, _)| *account_id)
            .collect())
    }

    fn delete_for_accounts(
        &self,
        period: Period,
        account_ids: &[AccountId],
    ) -> Result<usize, StoreError> {
        let mut map = self.rows.lock().expect("risk mutex poisoned");
        let before = map.len();
        map.retain(|(account_id, row_period), _| {
            *row_period != period || !account_ids.contains(account_id)
        });
        Ok(before - map.len())
    }
}

enum ScopeKey {
    Sector(String),
    Group(Uuid),
}

/// Versioned parameter rows. A replace never deletes; superseded rows are
/// flipped inactive, mirroring the soft-delete the relational store does.
#[derive(Default)]
pub struct InMemoryParameters {
    rows: Mutex<Vec<(ScopeKey, StoredParameter)>>,
}

impl InMemoryParameters {
    pub fn inactive_sector_rows(&self, sector: &str) -> usize {
        let rows = self.rows.lock().expect("parameter mutex poisoned");
        rows.iter()
            .filter(|(scope, row)| {
                matches!(scope, ScopeKey::Sector(s) if s == sector) && !row.active
            })
            .count()
    }
}

fn window_suffix(month: &str, window_months: u32) -> String {
    format!("::{month}::{window_months}m")
}

impl ParameterRepository for InMemoryParameters {
    fn sector_params(
        &self,
        sector: &str,
        month: &str,
        window_months: u32,
    ) -> Result<Vec<StoredParameter>, StoreError> {
        let suffix = window_suffix(month, window_months);
        let prefix = format!("{sector}__");
        let rows = self.rows.lock().expect("parameter mutex poisoned");
        Ok(rows
            .iter()
            .filter(|(scope, row)| {
                matches!(scope, ScopeKey::Sector(s) if s == sector)
                    && row.active
                    && row.name.starts_with(&prefix)
                    && row.name.ends_with(&suffix)
            })
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn group_params(
        &self,
        group_id: Uuid,
        month: &str,
        window_months: u32,
    ) -> Result<Vec<StoredParameter>, StoreError> {
        let suffix = window_suffix(month, window_months);
        let rows = self.rows.lock().expect("parameter mutex poisoned");
        Ok(rows
            .iter()
            .filter(|(scope, row)| {
                matches!(scope, ScopeKey::Group(g) if *g == group_id)
                    && row.active
                    && row.name.ends_with(&suffix)
            })
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn replace_sector_params(
        &self,
        sector: &str,
        month: &str,
        window_months: u32,
        rows: Vec<StoredParameter>,
    ) -> Result<(), StoreError> {
        let suffix = window_suffix(month, window_months);
        let mut stored = self.rows.lock().expect("parameter mutex poisoned");
        for (scope, row) in stored.iter_mut() {
            if matches!(scope, ScopeKey::Sector(s) if s == sector) && row.name.ends_with(&suffix) {
                row.active = false;
            }
        }
        stored.extend(
            rows.into_iter()
                .map(|row| (ScopeKey::Sector(sector.to_string()), row)),
        );
        Ok(())
    }

    fn replace_group_params(
        &self,
        group_id: Uuid,
        month: &str,
        window_months: u32,
        rows: Vec<StoredParameter>,
    ) -> Result<(), StoreError> {
        let suffix = window_suffix(month, window_months);
        let mut stored = self.rows.lock().expect("parameter mutex poisoned");
        for (scope, row) in stored.iter_mut() {
            if matches!(scope, ScopeKey::Group(g) if *g == group_id) && row.name.ends_with(&suffix)
            {
                row.active = false;
            }
        }
        stored.extend(rows.into_iter().map(|row| (ScopeKey::Group(group_id), row)));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySectorGroups {
    map: Mutex<HashMap<String, Uuid>>,
    names: Mutex<HashMap<Uuid, String>>,
}

impl InMemorySectorGroups {
    pub fn link(&self, sector: &str, group_id: Uuid) {
        self.map
            .lock()
            .expect("sector-group mutex poisoned")
            .insert(sector.to_string(), group_id);
    }
}

impl SectorGroupRepository for InMemorySectorGroups {
    fn group_for_sector(&self, sector: &str) -> Result<Option<Uuid>, StoreError> {
        let map = self.map.lock().expect("sector-group mutex poisoned");
        Ok(map.get(sector).copied())
    }

    fn sectors_in_group(&self, group_id: Uuid) -> Result<Vec<String>, StoreError> {
        let map = self.map.lock().expect("sector-group mutex poisoned");
        let mut sectors: Vec<String> = map
            .iter()
            .filter(|(_, g)| **g == group_id)
            .map(|(s, _)| s.clone())
            .collect();
        sectors.sort();
        Ok(sectors)
    }

    fn group_names(&self) -> Result<Vec<String>, StoreError> {
        let names = self.names.lock().expect("sector-group mutex poisoned");
        let mut out: Vec<String> = names.values().cloned().collect();
        out.sort();
        Ok(out)
    }

    fn upsert_group(&self, name: &str) -> Result<Uuid, StoreError> {
        let mut names = self.names.lock().expect("sector-group mutex poisoned");
        if let Some(id) = names
            .iter()
            .find_map(|(id, n)| (n.as_str() == name).then_some(*id))
        {
            return Ok(id);
        }
        let id = Uuid::new_v4();
        names.insert(id, name.to_string());
        Ok(id)
    }

    fn assign_sectors(&self, group_id: Uuid, sectors: &[String]) -> Result<(), StoreError> {
        let mut map = self.map.lock().expect("sector-group mutex poisoned");
        for sector in sectors {
            map.insert(sector.clone(), group_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn aggregate(period: &str, sector: &str) -> RawAggregateRow {
        RawAggregateRow {
            account_id: AccountId(Uuid::new_v4()),
            period: Period::parse(period).expect("valid period"),
            sector: sector.to_string(),
            window_months: 12,
            columns: BTreeMap::new(),
        }
    }

    #[test]
    fn scope_filters_cover_period_sector_and_all() {
        let store = InMemoryAggregates::default();
        store.push(aggregate("2025-01", "S01"));
        store.push(aggregate("2025-01", "S02"));
        store.push(aggregate("2025-02", "S01"));

        let period = Period::parse("2025-01").expect("valid period");
        assert_eq!(store.rows_for_period(period).expect("reads").len(), 2);
        assert_eq!(store.rows_for_sector(period, "S01").expect("reads").len(), 1);
        let scoped = store
            .rows_for_scope(period, Some(&["S01".to_string(), "S02".to_string()]))
            .expect("reads");
        assert_eq!(scoped.len(), 2);
        assert_eq!(store.rows_for_scope(period, None).expect("reads").len(), 2);
    }

    #[test]
    fn score_upsert_is_idempotent_per_account_period() {
        let store = InMemoryScores::default();
        let period = Period::parse("2025-01").expect("valid period");
        let account = AccountId(Uuid::new_v4());
        let mut row = ScoreOutput::failure(account, period, "S01".to_string(), "x".to_string());
        store.upsert_batch(std::slice::from_ref(&row)).expect("writes");
        row.error = Some("y".to_string());
        store.upsert_batch(std::slice::from_ref(&row)).expect("writes");
        assert_eq!(store.len(), 1);
        let stored = store.get(account, period).expect("row exists");
        assert_eq!(stored.error.as_deref(), Some("y"));
    }

    #[test]
    fn batch_fault_fires_once() {
        let store = InMemoryScores::default();
        store.set_fail_batch(true);
        assert!(store.upsert_batch(&[]).is_err());
        assert!(store.upsert_batch(&[]).is_ok());
    }

    #[test]
    fn row_fault_spares_failure_rows() {
        let store = InMemoryScores::default();
        let period = Period::parse("2025-01").expect("valid period");
        let account = AccountId(Uuid::new_v4());
        store.set_fail_account(Some(account));

        let failure = ScoreOutput::failure(account, period, "S01".to_string(), "x".to_string());
        store.upsert_one(&failure).expect("failure rows always land");

        let mut scored = failure;
        scored.error = None;
        assert!(matches!(
            store.upsert_one(&scored),
            Err(StoreError::RowRejected { .. })
        ));
    }

    #[test]
    fn group_upsert_is_idempotent_by_name_and_assignment_moves_sectors() {
        let groups = InMemorySectorGroups::default();
        let a = groups.upsert_group("Grupo 1").expect("writes");
        let b = groups.upsert_group("Grupo 1").expect("writes");
        assert_eq!(a, b);
        assert_eq!(groups.group_names().expect("reads"), vec!["Grupo 1"]);

        groups.assign_sectors(a, &["S01".to_string()]).expect("writes");
        let c = groups.upsert_group("Grupo 2").expect("writes");
        groups.assign_sectors(c, &["S01".to_string()]).expect("writes");
        assert_eq!(groups.group_for_sector("S01").expect("reads"), Some(c));
        assert!(groups.sectors_in_group(a).expect("reads").is_empty());
    }

    #[test]
    fn group_membership_is_queryable_both_ways() {
        let groups = InMemorySectorGroups::default();
        let group_id = Uuid::new_v4();
        groups.link("S01", group_id);
        groups.link("S02", group_id);
        groups.link("S03", Uuid::new_v4());

        assert_eq!(groups.group_for_sector("S01").expect("reads"), Some(group_id));
        assert_eq!(groups.group_for_sector("S99").expect("reads"), None);
        assert_eq!(
            groups.sectors_in_group(group_id).expect("reads"),
            vec!["S01".to_string(), "S02".to_string()]
        );
    }
}
