//! Gateway server binary: loads config, wires services, serves HTTP.

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = serve::run_serve(None).await {
        tracing::error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
