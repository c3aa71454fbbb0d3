//! Named sector groups. A group is the coarse scope coefficients can be
//! pinned to; membership is many-sectors-to-one-group and re-associating
//! a sector moves it out of its prior group.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::store::{SectorGroupRepository, StoreError};

#[derive(Debug, Error)]
pub enum GroupsError {
    #[error("setores must be a non-empty list")]
    EmptySectors,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveGroupRequest {
    /// Group name; omitted or blank gets the next free "Grupo N".
    #[serde(default)]
    pub nome: Option<String>,
    pub setores: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub grupo_id: Uuid,
    pub nome: String,
    pub setores: Vec<String>,
}

/// Creates or updates a named group and points sectors at it.
#[derive(Clone)]
pub struct GroupsService {
    groups: Arc<dyn SectorGroupRepository>,
}

impl GroupsService {
    pub fn new(groups: Arc<dyn SectorGroupRepository>) -> Self {
        Self { groups }
    }

    pub fn save(&self, request: &SaveGroupRequest) -> Result<GroupSummary, GroupsError> {
        let setores: Vec<String> = request
            .setores
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if setores.is_empty() {
            return Err(GroupsError::EmptySectors);
        }

        let nome = match request.nome.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(nome) => nome.to_string(),
            None => next_group_name(&self.groups.group_names()?),
        };

        let grupo_id = self.groups.upsert_group(&nome)?;
        self.groups.assign_sectors(grupo_id, &setores)?;
        info!(%grupo_id, nome = %nome, setores = setores.len(), "sector group saved");

        let setores = self.groups.sectors_in_group(grupo_id)?;
        Ok(GroupSummary {
            grupo_id,
            nome,
            setores,
        })
    }
}

/// Next free name in the "Grupo N" sequence. Names outside the pattern
/// never block the counter.
fn next_group_name(existing: &[String]) -> String {
    let next = existing
        .iter()
        .filter_map(|name| name.strip_prefix("Grupo ")?.trim().parse::<u32>().ok())
        .max()
        .map_or(1, |n| n + 1);
    format!("Grupo {next}")
}
