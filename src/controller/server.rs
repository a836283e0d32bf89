use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::agent::{Agent, AgentResponse, AgentState};
use super::manager_api::ManagerClient;
use super::provider::{AgentIdentity, Provider};
use crate::errors::AppError;
use crate::metrics;

/// Shared state of the controller's agent-facing HTTP API.
#[derive(Clone)]
pub struct ControllerApiState {
    pub provider: Arc<dyn Provider>,
    pub manager: Arc<dyn ManagerClient>,
    pub registry: prometheus::Registry,
    pub disable_update: Option<bool>,
}

pub fn router(state: ControllerApiState) -> Router {
    let api = Router::new()
        .route("/agent", post(register_agent))
        .route("/agent/{id}", get(get_agent).delete(delete_agent))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ));

    Router::new()
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "starting controller server");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Resolves the calling pod through the provider and stashes its
/// identity for the handlers.
async fn authenticate(
    State(state): State<ControllerApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let identity = state.provider.authenticate(request.headers()).await?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

#[derive(Deserialize)]
struct RegisterForm {
    #[serde(rename = "hostName", default)]
    host_name: String,
}

async fn register_agent(
    State(state): State<ControllerApiState>,
    Extension(identity): Extension<AgentIdentity>,
    Form(form): Form<RegisterForm>,
) -> Result<Json<AgentResponse>, AppError> {
    if form.host_name.is_empty() {
        return Err(AppError::BadRequest("empty hostName".into()));
    }

    let (reg_token, target_url) = state.manager.get_registration_token().await.map_err(|err| {
        error!(error = %err, "cannot get registration token");
        AppError::InternalServerError("cannot get registration token".into())
    })?;

    let response = state
        .provider
        .register_agent(
            &identity,
            &form.host_name,
            &reg_token,
            &target_url,
            state.disable_update,
        )
        .await
        .map_err(|err| {
            error!(error = %err, host_name = %form.host_name, "cannot register agent");
            AppError::InternalServerError(format!("cannot register agent: {err}"))
        })?;

    Ok(Json(response))
}

async fn get_agent(
    State(state): State<ControllerApiState>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, AppError> {
    let agent = state
        .provider
        .state()
        .get(&id)
        .await
        .map_err(|err| AppError::InternalServerError(err.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("no such agent: {id}")))?;

    Ok(Json(agent))
}

async fn delete_agent(
    State(state): State<ControllerApiState>,
    Path(id): Path<String>,
) -> Result<(), AppError> {
    let agent = state
        .provider
        .state()
        .get(&id)
        .await
        .map_err(|err| AppError::InternalServerError(err.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("no such agent: {id}")))?;

    if agent.state != AgentState::Terminating {
        info!(id = %agent.id, "requested agent termination");
        let now = Utc::now();
        state
            .provider
            .state()
            .update(&agent.id, &|a: &mut Agent| {
                a.transition(AgentState::Terminating, now);
            })
            .await
            .map_err(|err| {
                error!(error = %err, id = %agent.id, "failed to terminate agent");
                AppError::InternalServerError(err.to_string())
            })?;
    }

    Ok(())
}

async fn metrics_handler(
    State(state): State<ControllerApiState>,
) -> Result<String, AppError> {
    metrics::render(&state.registry).map_err(|err| AppError::InternalServerError(err.to_string()))
}
