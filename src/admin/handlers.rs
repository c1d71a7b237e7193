use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::lifecycle::startup::VERSION;
use crate::lifecycle::AresStatus;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn get_health() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: VERSION,
    })
}

pub async fn get_status(State(state): State<AdminState>) -> Json<AresStatus> {
    Json(state.ares.status())
}
