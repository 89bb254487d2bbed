//! Catalog listing

use std::collections::BTreeSet;

use axum::{extract::State, Json};
use glimpse_core::{Family, GenerationParams, HandleState, MemoryClass, Mode};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

/// One catalog entry together with the live state of its handle.
#[derive(Serialize)]
pub struct ModelInfo {
    pub key: String,
    pub name: String,
    pub description: String,
    pub family: Family,
    pub modes: BTreeSet<Mode>,
    pub default_mode: Option<Mode>,
    pub memory_class: MemoryClass,
    pub default_parameters: Option<GenerationParams>,
    pub state: HandleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<u64>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let governor = &state.governor;
    let status = governor.registry().status();

    let models = governor
        .catalog()
        .list()
        .iter()
        .map(|descriptor| {
            let handle = status.iter().find(|s| s.key == descriptor.key);
            ModelInfo {
                key: descriptor.key.clone(),
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                family: descriptor.family,
                modes: descriptor.capabilities.clone(),
                default_mode: descriptor.default_mode,
                memory_class: descriptor.memory_class,
                default_parameters: descriptor.default_parameters,
                state: handle.map_or(HandleState::Unloaded, |s| s.state),
                loaded_at: handle.and_then(|s| s.loaded_at),
            }
        })
        .collect();

    Json(ModelsResponse { models })
}
