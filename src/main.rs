//! Voice Assistant - call and SMS orchestration server
//!
//! Receives telephony provider webhooks and answers with provider markup,
//! using a language model to decide what to say next.

mod models;
mod server;

fn main() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("voip_assistant=info".parse().expect("static directive")))
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match server::config::ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting voice assistant server on port {}", config.port);

    if let Err(e) = runtime.block_on(server::run_server(config)) {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
