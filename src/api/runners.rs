use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use super::ApiState;
use crate::errors::{AppError, UnexpectedStatus};
use crate::github::runners::RunnerInstance;

#[derive(Debug, Serialize)]
pub struct RunnersResponse {
    pub epoch: i64,
    pub runners: Vec<RunnerInstance>,
}

/// GET /api/v1/runners: the latest complete snapshot. Epoch 0 with an
/// empty list means no pass has completed yet.
pub async fn list_runners(State(state): State<ApiState>) -> Json<RunnersResponse> {
    let snapshot = state.runners.value();

    let mut runners: Vec<RunnerInstance> = snapshot.instances.values().cloned().collect();
    runners.sort_by_key(|instance| instance.id);

    Json(RunnersResponse {
        epoch: snapshot.epoch,
        runners,
    })
}

/// DELETE /api/v1/runners/{id}: removes the runner on the target,
/// propagating the upstream status on failure.
pub async fn delete_runner(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<(), AppError> {
    state.target.delete_runner(id).await.map_err(|err| {
        warn!(error = %err, id, "failed to delete runner");
        match err.downcast_ref::<UnexpectedStatus>() {
            Some(UnexpectedStatus(status)) => AppError::Upstream(*status, err.to_string()),
            None => AppError::InternalServerError(err.to_string()),
        }
    })
}
