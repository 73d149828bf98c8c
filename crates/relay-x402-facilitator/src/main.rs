use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use alloy::primitives::Address;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use x402::{FacilitatorConfig, FeePolicy, SqliteStore, Store};
use x402_facilitator::bootstrap::{bootstrap, LedgerMode};
use x402_facilitator::routes;

fn parse_cors_origins() -> Vec<String> {
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) => origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => vec![],
    }
}

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "idempotency-key", "authorization"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "idempotency-key", "authorization"])
            .max_age(3600)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let treasury: Address = std::env::var("TREASURY_ADDRESS")
        .expect("TREASURY_ADDRESS environment variable is required")
        .parse()
        .expect("invalid TREASURY_ADDRESS");

    let fee_bps = u16::try_from(env_u64("FEE_BPS_DEFAULT", 100)).unwrap_or(u16::MAX);
    let fee = FeePolicy::new(fee_bps, treasury).unwrap_or_else(|e| {
        tracing::error!("invalid fee policy: {e}");
        std::process::exit(1);
    });

    let mut config = FacilitatorConfig::new(fee);
    config.rate_limit_rpm = env_u64("RATE_LIMIT_RPM", 120);
    config.reconcile_interval_secs = env_u64("RECONCILE_INTERVAL_SECS", 30);
    config.wait_for_confirmations = std::env::var("WAIT_FOR_CONFIRMATIONS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    // Per-network RPC overrides: BASE_SEPOLIA_RPC_URL and friends.
    for network in config.networks.values_mut() {
        let var = format!(
            "{}_RPC_URL",
            network.network.replace('-', "_").to_uppercase()
        );
        if let Ok(url) = std::env::var(&var) {
            if !url.is_empty() {
                network.rpc_url = url;
            }
        }
    }

    // The durable store is mandatory at startup: without it, in-flight
    // settlements cannot be recovered after a crash.
    let db_path = std::env::var("STORE_DB_PATH").unwrap_or_else(|_| "./x402-relay.db".to_string());
    let store: Arc<dyn Store> = match SqliteStore::open(&db_path) {
        Ok(store) => {
            tracing::info!("store: SQLite at {db_path}");
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!("failed to open SQLite store at {db_path}: {e}");
            tracing::error!(
                "refusing to start: settlement records must survive restarts for finality tracking"
            );
            std::process::exit(1);
        }
    };

    let mode = match std::env::var("FACILITATOR_MODE").as_deref() {
        Ok("sim") => LedgerMode::Sim,
        _ => LedgerMode::Evm {
            private_key: std::env::var("FACILITATOR_PRIVATE_KEY")
                .expect("FACILITATOR_PRIVATE_KEY environment variable is required"),
        },
    };

    let metrics_token = std::env::var("METRICS_TOKEN")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.into_bytes());
    if metrics_token.is_none() {
        tracing::warn!("METRICS_TOKEN not set; /metrics stays forbidden unless opted public");
    }

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8402);
    let rate_limit_rpm = config.rate_limit_rpm;

    let state = web::Data::new(bootstrap(config, mode, store, metrics_token));

    let cors_origins = parse_cors_origins();

    tracing::info!("x402 relay facilitator listening on port {port}");
    tracing::info!("rate limit: {rate_limit_rpm} req/min per IP");
    tracing::info!("  GET  http://localhost:{port}/supported");
    tracing::info!("  POST http://localhost:{port}/verify");
    tracing::info!("  POST http://localhost:{port}/settle");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::supported)
            .service(routes::fee_quote)
            .service(routes::verify)
            .service(routes::settle)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
