//! Server-side code for the voice assistant
//!
//! This module contains the webhook engine:
//! - Call state machine and provider markup
//! - Language-model orchestration (Anthropic Messages API)
//! - Contact resolution and the call/message ledger (PostgreSQL via sqlx, or in-memory)
//! - Live dashboard events over SSE

pub mod call_flow;
pub mod claude;
pub mod config;
pub mod contacts;
pub mod events;
pub mod hours;
pub mod ledger;
pub mod llm;
pub mod locks;
pub mod markup;
pub mod orchestrator;
pub mod sanitizer;
pub mod sms;
pub mod voice;


use axum::{
    extract::State,
    http::Method,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::DashboardEvent;
use call_flow::WebhookUrls;
use config::ServerConfig;
use contacts::ContactResolver;
use events::EventBroadcaster;
use ledger::{Ledger, LedgerError, MemoryLedger, MissedWrite, MissedWrites, PgLedger};
use llm::LanguageModel;
use locks::CallLocks;
use orchestrator::{Orchestrator, RetryPolicy};
use sanitizer::ContentSanitizer;

const EVENT_BUFFER: usize = 64;
const MISSED_WRITE_HISTORY: usize = 256;

/// Application state shared across all routes
pub struct AppState {
    pub config: ServerConfig,
    pub urls: WebhookUrls,
    pub ledger: Arc<dyn Ledger>,
    pub contacts: ContactResolver,
    pub orchestrator: Orchestrator,
    pub broadcaster: EventBroadcaster,
    pub locks: CallLocks,
    pub missed_writes: MissedWrites,
    ledger_kind: &'static str,
}

impl AppState {
    pub fn new(config: ServerConfig, ledger: Arc<dyn Ledger>, model: Arc<dyn LanguageModel>) -> Self {
        let sanitizer = Arc::new(ContentSanitizer::new());
        let policy = RetryPolicy::from_config(&config.llm);
        tracing::debug!(
            "Model decisions: {} attempts, fallback within {:?}",
            policy.max_attempts,
            policy.ceiling()
        );
        let orchestrator = Orchestrator::new(model, sanitizer, policy, config.llm.max_tokens);

        Self {
            urls: WebhookUrls::from_config(&config),
            contacts: ContactResolver::new(ledger.clone()),
            ledger,
            orchestrator,
            broadcaster: EventBroadcaster::new(EVENT_BUFFER),
            locks: CallLocks::new(),
            missed_writes: MissedWrites::new(MISSED_WRITE_HISTORY),
            config,
            ledger_kind: "memory",
        }
    }

    fn with_ledger_kind(mut self, kind: &'static str) -> Self {
        self.ledger_kind = kind;
        self
    }

    pub async fn publish(&self, event: DashboardEvent) {
        let delivered = self.broadcaster.publish(event).await;
        tracing::trace!("Event delivered to {} listeners", delivered);
    }

    /// Log and remember a write that did not happen.
    pub async fn write_failed(&self, operation: &'static str, key: &str, error: &LedgerError) {
        self.missed_writes.record(operation, key, error).await;
    }
}

/// Create the Axum router with all webhook and dashboard routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(health_check))
        .route("/api/missed-writes", get(missed_writes))

        // Dashboard live events
        .route("/api/events/{business_id}", get(events::event_stream))

        // Voice webhooks
        .route("/voice", post(voice::incoming_call))
        .route("/voice/speech", post(voice::speech_result))
        .route("/voice/appointment", post(voice::appointment_result))
        .route("/voice/voicemail", post(voice::voicemail))
        .route("/voice/recording", post(voice::recording_finished))
        .route("/voice/status", post(voice::call_status))

        // SMS webhooks
        .route("/sms/inbound", post(sms::inbound_message))
        .route("/sms/status", post(sms::message_status))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    ledger: &'static str,
    #[serde(rename = "missedWrites")]
    missed_writes: u64,
}

// Health check
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let missed_writes = state.missed_writes.total();
    Json(HealthResponse {
        status: if missed_writes == 0 { "ok" } else { "degraded" },
        ledger: state.ledger_kind,
        missed_writes,
    })
}

/// Recent ledger writes that failed, oldest first.
async fn missed_writes(State(state): State<Arc<AppState>>) -> Json<Vec<MissedWrite>> {
    Json(state.missed_writes.recent().await)
}

/// Run the server
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let model = Arc::new(claude::ClaudeClient::from_config(&config.llm));
    if config.llm.api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY not set; every call will take the fallback path");
    }

    let port = config.port;
    let state = match config.database_url.clone() {
        Some(database_url) => {
            let pg = PgLedger::connect(&database_url).await?;
            if let Some(business) = &config.seed_business {
                let stored = pg.upsert_business(business).await?;
                tracing::info!("Business '{}' registered as id {}", stored.name, stored.id);
            }
            AppState::new(config, Arc::new(pg), model).with_ledger_kind("postgres")
        }
        None => {
            tracing::info!("DATABASE_URL not set, using the in-memory ledger");
            let ledger = match &config.seed_business {
                Some(business) => MemoryLedger::with_business(business.clone()),
                None => MemoryLedger::new(),
            };
            AppState::new(config, Arc::new(ledger), model)
        }
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
