//! HTTP surface of the bisect service: webhook ingress plus the operator
//! read endpoints, wired over any [`JobStore`].

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use secrecy::SecretString;

use bisectd::forge::Forge;
use bisectd::job::WorkerId;
use bisectd::sandbox::Sandbox;
use bisectd::scheduler::Waker;
use bisectd::store::JobStore;

pub mod routes;
pub mod webhook;

pub struct AppState<S> {
    pub store: S,
    pub forge: Arc<dyn Forge>,
    pub sandbox: Arc<dyn Sandbox>,
    pub webhook_secret: SecretString,
    pub waker: Waker,
    pub worker: WorkerId,
    pub max_concurrent_jobs: u32,
}

impl<S: Clone> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            forge: Arc::clone(&self.forge),
            sandbox: Arc::clone(&self.sandbox),
            webhook_secret: self.webhook_secret.clone(),
            waker: self.waker.clone(),
            worker: self.worker.clone(),
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }
}

pub fn router<S: JobStore + Clone + Send + Sync + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/webhook", post(webhook::deliver::<S>))
        .route("/health", get(routes::health::<S>))
        .route("/stats", get(routes::stats::<S>))
        .route("/job/:id", get(routes::job::<S>))
        .with_state(state)
}
