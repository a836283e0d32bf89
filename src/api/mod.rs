//! The manager's HTTP API: registration token, runner snapshot, and
//! runner removal, guarded by static bearer keys.

pub mod auth;
pub mod runners;
pub mod token;

use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::AppError;
use crate::github::reg_token::RegistrationTokenStore;
use crate::github::runners::RunnerSnapshot;
use crate::github::Target;
use crate::metrics;
use crate::utils::broadcaster::Broadcaster;

#[derive(Clone)]
pub struct ApiState {
    pub runners: Arc<Broadcaster<Arc<RunnerSnapshot>>>,
    pub target: Arc<dyn Target>,
    pub reg_token: Arc<RegistrationTokenStore>,
    pub registry: prometheus::Registry,
}

pub fn router(state: ApiState, auth_keys: Vec<String>) -> Router {
    let api = Router::new()
        .route("/token", get(token::get_token))
        .route("/runners", get(runners::list_runners))
        .route("/runners/{id}", axum::routing::delete(runners::delete_runner))
        .layer(middleware::from_fn_with_state(
            auth::AuthKeys(auth_keys),
            auth::key_auth,
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
    info!(addr = %listener.local_addr()?, "starting manager server");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn metrics_handler(State(state): State<ApiState>) -> Result<String, AppError> {
    metrics::render(&state.registry).map_err(|err| AppError::InternalServerError(err.to_string()))
}
