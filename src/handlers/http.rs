//! HTTP handlers: health and neighborhood lookup.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::IdentityProvider;
use crate::config::SyncSettings;
use crate::error::AppError;
use crate::geo::{self, Neighborhood};
use crate::models::position::{share_query, Position};
use crate::prefs::MemoryPreferences;
use crate::repositories::MessageLog;
use crate::services::SessionService;

/// Shared application state for HTTP and WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn MessageLog>,
    pub identity: Arc<dyn IdentityProvider>,
    pub settings: SyncSettings,
}

impl AppState {
    pub fn new(
        log: Arc<dyn MessageLog>,
        identity: Arc<dyn IdentityProvider>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            log,
            identity,
            settings,
        }
    }

    /// A fresh session for one connected client. Preferences live as long
    /// as the connection.
    pub fn new_session(&self) -> SessionService {
        SessionService::new(
            self.log.clone(),
            self.identity.clone(),
            Arc::new(MemoryPreferences::new()),
            self.settings,
        )
    }
}

/// GET /api/cells?lat=..&lng=.. — the cells a client at that position
/// listens to, center first, each with its rectangle for drawing.
pub async fn cells(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let position = Position::from_query(&params)?;
    let Neighborhood { center, cells } =
        Neighborhood::around(position, state.settings.cell_precision);
    let cells: Vec<_> = cells
        .iter()
        .map(|cell| json!({ "cell": cell, "bounds": geo::bounds(cell) }))
        .collect();

    Ok(Json(json!({
        "position": position,
        "center": center,
        "cells": cells,
        "share_query": share_query(position),
    })))
}

/// GET /health — liveness probe.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "fugumap" })),
    )
}
