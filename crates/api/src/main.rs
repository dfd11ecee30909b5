use std::sync::Arc;
use std::time::Duration;

use compliance_api::config::ApiConfig;
use compliance_api::lifecycle::ComplianceApiServer;
use compliance_store::PgStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match ApiConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let server = ComplianceApiServer::new(&config);

    let started = if config.db_migrate {
        let store = match PgStore::connect_and_migrate(
            &config.db_url,
            config.db_max_connections,
            Duration::from_millis(config.store_timeout_ms),
        )
        .await
        {
            Ok(store) => store,
            Err(err) => {
                eprintln!("STARTUP_ERROR ERR_STORE_UNAVAILABLE {}", err);
                std::process::exit(1);
            }
        };
        server.start_with_store(Arc::new(store)).await
    } else {
        server.start(&config.db_url).await
    };

    if let Err(err) = started {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }

    if let Err(err) = server.stop().await {
        eprintln!("SHUTDOWN_ERROR {}", err);
        std::process::exit(1);
    }
}
