use std::sync::atomic::{AtomicBool, Ordering};

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use alloy::primitives::U256;
use serde::Deserialize;

use x402::{
    compute_fee, fee_breakdown, normalize, PaymentHeader, PaymentRequirements, SettleResponse,
    VerifyResponse, X402Error,
};

use crate::metrics;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub x402_version: u32,
    pub payment_header: PaymentHeader,
    pub payment_requirements: PaymentRequirements,
    /// Opaque token from an external consensus layer, echoed back.
    #[serde(default)]
    pub consensus_proof: Option<String>,
}

/// Caller identity for rate limiting: real IP or tenant placeholder.
fn client_identity(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

fn idempotency_key(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Apply the per-identity rate limit. Returns the 429 response when over.
fn enforce_rate_limit(req: &HttpRequest, state: &AppState) -> Result<(), HttpResponse> {
    match state.rate_limiter.check(&client_identity(req)) {
        Ok(()) => Ok(()),
        Err(X402Error::RateLimitExceeded { retry_after }) => {
            metrics::RATE_LIMITED.inc();
            Err(HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": "Rate limit exceeded",
                "retryAfter": retry_after,
            })))
        }
        Err(e) => Err(error_response(&e)),
    }
}

/// Map core errors onto the HTTP surface. Input errors are 4xx with a
/// stable reason; infrastructure errors are 5xx and never masquerade as
/// success.
fn error_response(e: &X402Error) -> HttpResponse {
    match e {
        X402Error::MalformedAuthorization(_)
        | X402Error::MalformedSignature(_)
        | X402Error::SerdeError(_) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": e.to_string(),
            "code": "INVALID_REQUEST",
        })),
        X402Error::IdempotencyKeyConflict(_) => {
            HttpResponse::Conflict().json(serde_json::json!({
                "error": e.to_string(),
                "code": "IDEMPOTENCY_KEY_CONFLICT",
            }))
        }
        X402Error::RateLimitExceeded { retry_after } => {
            HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": "Rate limit exceeded",
                "retryAfter": retry_after,
            }))
        }
        // The transfer may still land: tell the caller the outcome is
        // unknown so they re-query instead of resubmitting.
        X402Error::Timeout(_) => HttpResponse::GatewayTimeout().json(serde_json::json!({
            "error": e.to_string(),
            "code": "OUTCOME_UNKNOWN",
        })),
        X402Error::ConfigError(_) => HttpResponse::BadRequest().json(serde_json::json!({
            "error": e.to_string(),
            "code": "UNSUPPORTED",
        })),
        X402Error::LedgerError(_) | X402Error::StoreError(_) => {
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": e.to_string(),
                "code": "UPSTREAM_UNAVAILABLE",
            }))
        }
        X402Error::LedgerRejected(_) | X402Error::SettlementFailed(_) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": e.to_string(),
                "code": "SETTLEMENT_FAILED",
            }))
        }
    }
}

async fn run_verify(state: &AppState, request: &PaymentRequest) -> Result<String, X402Error> {
    let auth = normalize(&request.payment_header, &request.payment_requirements)?;
    let result = state
        .engine
        .verify(&request.payment_requirements, &auth)
        .await?;

    // Fee preview for accepted payments, so clients see the split before
    // settling.
    let fee = result
        .is_valid
        .then(|| compute_fee(auth.value, state.config.fee.fee_bps));
    let response =
        VerifyResponse::from_result(&result, fee.as_ref(), request.consensus_proof.clone());

    metrics::VERIFY_REQUESTS
        .with_label_values(&[if result.is_valid { "valid" } else { "invalid" }])
        .inc();

    Ok(serde_json::to_string(&response)?)
}

#[post("/verify")]
pub async fn verify(req: HttpRequest, state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if let Err(resp) = enforce_rate_limit(&req, &state) {
        return resp;
    }
    let parsed: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            metrics::VERIFY_REQUESTS.with_label_values(&["error"]).inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("invalid request body: {e}"),
                "code": "INVALID_REQUEST",
            }));
        }
    };

    let key = idempotency_key(&req);
    let outcome = state
        .idempotency
        .guard(key.as_deref(), "/verify", &body, || async {
            run_verify(&state, &parsed).await
        })
        .await;

    match outcome {
        Ok(json) => HttpResponse::Ok()
            .content_type("application/json")
            .body(json),
        Err(e) => error_response(&e),
    }
}

async fn run_settle(state: &AppState, request: &PaymentRequest) -> Result<String, X402Error> {
    let start = std::time::Instant::now();
    let auth = normalize(&request.payment_header, &request.payment_requirements)?;
    let result = state
        .engine
        .verify(&request.payment_requirements, &auth)
        .await?;

    if !result.is_valid {
        let reason = result
            .invalid_reason
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| "verification failed".to_string());
        tracing::warn!(
            payer = ?result.payer,
            reason = %reason,
            "settlement rejected by verification"
        );
        metrics::SETTLE_REQUESTS
            .with_label_values(&["rejected"])
            .inc();
        let response = SettleResponse::rejected(reason, &request.payment_requirements.network);
        return Ok(serde_json::to_string(&response)?);
    }

    let fee = compute_fee(auth.value, state.config.fee.fee_bps);
    let response = match state
        .executor
        .settle(&request.payment_requirements, &auth, &fee)
        .await
    {
        Ok(record) => {
            metrics::SETTLE_REQUESTS
                .with_label_values(&["success"])
                .inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&["success"])
                .observe(start.elapsed().as_secs_f64());
            tracing::info!(
                payer = %auth.from,
                tx = %record.tx_hash,
                status = record.status.as_str(),
                "settlement completed"
            );
            SettleResponse::settled(&record, &fee, request.consensus_proof.clone())
        }
        // A clean abort before anything persisted: a normal protocol
        // outcome, reported in the settle response shape.
        Err(X402Error::SettlementFailed(reason)) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["failed"]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&["failed"])
                .observe(start.elapsed().as_secs_f64());
            tracing::error!(payer = %auth.from, error = %reason, "settlement failed");
            SettleResponse::rejected(reason, &request.payment_requirements.network)
        }
        // Timeouts and infrastructure faults propagate; they must not be
        // cached as responses.
        Err(e) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["error"]).inc();
            metrics::SETTLE_LATENCY
                .with_label_values(&["error"])
                .observe(start.elapsed().as_secs_f64());
            return Err(e);
        }
    };

    Ok(serde_json::to_string(&response)?)
}

#[post("/settle")]
pub async fn settle(req: HttpRequest, state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if let Err(resp) = enforce_rate_limit(&req, &state) {
        return resp;
    }
    let parsed: PaymentRequest = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            metrics::SETTLE_REQUESTS.with_label_values(&["error"]).inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("invalid request body: {e}"),
                "code": "INVALID_REQUEST",
            }));
        }
    };

    let key = idempotency_key(&req);
    let executed = AtomicBool::new(false);
    let outcome = state
        .idempotency
        .guard(key.as_deref(), "/settle", &body, || async {
            executed.store(true, Ordering::SeqCst);
            run_settle(&state, &parsed).await
        })
        .await;

    if outcome.is_ok() && !executed.load(Ordering::SeqCst) {
        metrics::IDEMPOTENT_REPLAYS.inc();
    }

    match outcome {
        Ok(json) => HttpResponse::Ok()
            .content_type("application/json")
            .body(json),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct FeeQuery {
    /// Gross amount, base units.
    pub amount: String,
    /// Asset symbol, defaults to USDC.
    pub asset: Option<String>,
    /// Network to resolve the asset on, defaults to any that carries it.
    pub network: Option<String>,
}

#[get("/fee-breakdown")]
pub async fn fee_quote(state: web::Data<AppState>, query: web::Query<FeeQuery>) -> HttpResponse {
    let Ok(gross) = query.amount.parse::<U256>() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("amount must be a base-unit integer, got {:?}", query.amount),
            "code": "INVALID_REQUEST",
        }));
    };

    let symbol = query.asset.as_deref().unwrap_or("USDC");
    let asset = state
        .config
        .networks
        .values()
        .filter(|n| {
            query
                .network
                .as_deref()
                .map(|wanted| n.network == wanted)
                .unwrap_or(true)
        })
        .find_map(|n| n.asset_by_symbol(symbol));

    let Some(asset) = asset else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("unsupported asset: {symbol}"),
            "code": "UNSUPPORTED",
        }));
    };

    let quote = fee_breakdown(gross, state.config.fee.fee_bps, &asset.symbol, asset.decimals);
    HttpResponse::Ok().json(quote)
}

#[get("/supported")]
pub async fn supported(state: web::Data<AppState>) -> HttpResponse {
    let kinds: Vec<_> = state
        .config
        .supported_kinds()
        .into_iter()
        .map(|(scheme, network)| serde_json::json!({"scheme": scheme, "network": network}))
        .collect();
    HttpResponse::Ok().json(serde_json::json!({ "kinds": kinds }))
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let mut networks = serde_json::Map::new();
    let mut reachable = 0usize;
    for (name, ledger) in &state.ledgers {
        match ledger.height().await {
            Ok(height) => {
                reachable += 1;
                networks.insert(
                    name.clone(),
                    serde_json::json!({"status": "ok", "height": height.to_string()}),
                );
            }
            Err(e) => {
                networks.insert(
                    name.clone(),
                    serde_json::json!({"status": "unreachable", "error": e.to_string()}),
                );
            }
        }
    }

    let body = serde_json::json!({
        "status": if reachable > 0 { "ok" } else { "degraded" },
        "service": "x402-relay-facilitator",
        "networks": networks,
    });
    if reachable > 0 {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| x402::security::constant_time_eq(t.as_bytes(), token))
                .unwrap_or(false);

            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics",
                }));
            }
        }
        None => {
            // Protected by default; opting into public metrics is explicit.
            let public_metrics = std::env::var("X402_PUBLIC_METRICS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
            if !public_metrics {
                return HttpResponse::Forbidden().json(serde_json::json!({
                    "error": "forbidden",
                    "message": "Set METRICS_TOKEN or X402_PUBLIC_METRICS=true to access /metrics",
                }));
            }
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}
