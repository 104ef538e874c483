use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::TaskError;
use crate::models::api::{
    CancelResponse, CreditBalanceResponse, SubmitTaskRequest, SubmitTaskResponse, TaskLogResponse,
    TaskView,
};
use crate::models::task::Task;
use crate::routes::auth::Owner;

/// POST /api/v1/tasks: submit a generation task.
///
/// 202 for a new task, 200 when a reused `client_request_id` matched an existing one.
/// Malformed bodies, including a `client_request_id` that is not a UUID, are 400.
pub async fn submit_task(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    payload: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), TaskError> {
    let Json(request) = payload?;
    let (input, client_request_id) = request.into_parts();
    let outcome = state
        .engine
        .submission
        .submit(&owner_id, input, client_request_id)
        .await?;

    let status = if outcome.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(SubmitTaskResponse {
            task_id: outcome.task.id,
            status: outcome.task.status,
        }),
    ))
}

/// GET /api/v1/tasks/{task_id}: poll task progress.
pub async fn get_task(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskView>, TaskError> {
    let task = owned_task(&state, task_id, &owner_id).await?;
    Ok(Json(state.engine.progress.view(&task, Utc::now())))
}

/// POST /api/v1/tasks/{task_id}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(task_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, TaskError> {
    let outcome = state.engine.cancellation.cancel(task_id, &owner_id).await?;
    Ok(Json(CancelResponse {
        task_id,
        status: outcome.task.status,
        newly_cancelled: outcome.newly_cancelled,
    }))
}

/// GET /api/v1/tasks/{task_id}/logs: audit trail.
pub async fn task_logs(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskLogResponse>, TaskError> {
    owned_task(&state, task_id, &owner_id).await?;
    let entries = state.engine.tasks.list_logs(task_id).await?;
    Ok(Json(TaskLogResponse { task_id, entries }))
}

/// GET /api/v1/credits
pub async fn get_credits(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
) -> Result<Json<CreditBalanceResponse>, TaskError> {
    let balance = state.engine.ledger.balance(&owner_id).await?;
    Ok(Json(CreditBalanceResponse { owner_id, balance }))
}

async fn owned_task(state: &AppState, task_id: Uuid, owner_id: &str) -> Result<Task, TaskError> {
    let task = state
        .engine
        .tasks
        .get_task(task_id)
        .await?
        .ok_or(TaskError::NotFound)?;
    if task.owner_id != owner_id {
        return Err(TaskError::Forbidden);
    }
    Ok(task)
}
