//! HTTP surface: sync trigger, Shopify webhook intake, health probe.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::coordinator::{self, StartSync};
use crate::db::{self, Pool};
use crate::model::{CustomerRecord, OrderRecord, ProductRecord};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub webhook_secret: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync/:tenant_id", post(start_sync))
        .route("/shopify-webhooks/webhook", post(shopify_webhook))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// POST /sync/{tenantId}
// ---------------------------------------------------------------------------

async fn start_sync(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(api_key) = bearer_token(&headers) else {
        return msg_response(StatusCode::UNAUTHORIZED, "Missing or malformed bearer token");
    };
    let requester = match db::user_id_by_api_key(&state.pool, api_key).await {
        Ok(Some(id)) => id,
        Ok(None) => return msg_response(StatusCode::UNAUTHORIZED, "Unknown API key"),
        Err(err) => {
            error!(?err, "api key lookup failed");
            return msg_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    match coordinator::start_sync(&state.pool, &tenant_id, &requester).await {
        Ok(StartSync::Started) => msg_response(StatusCode::OK, "Sync started..."),
        Ok(StartSync::AlreadySyncing) => msg_response(
            StatusCode::ALREADY_REPORTED,
            "Is already under sync, please wait for some time",
        ),
        Ok(StartSync::Unauthorized) => {
            msg_response(StatusCode::UNAUTHORIZED, "Unauthorized or Tenant not found")
        }
        Err(err) => {
            error!(?err, tenant_id, "failed to start sync");
            msg_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn msg_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "msg": msg }))).into_response()
}

// ---------------------------------------------------------------------------
// POST /shopify-webhooks/webhook
// ---------------------------------------------------------------------------

/// Verify the base64 HMAC-SHA256 signature Shopify computes over the raw
/// request body. Comparison is constant-time.
pub fn verify_webhook_hmac(secret: &[u8], body: &[u8], signature_b64: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    let Ok(expected) = BASE64.decode(signature_b64) else {
        return false;
    };
    constant_time_eq(computed.as_slice(), &expected)
}

async fn shopify_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = header_str(&headers, "x-shopify-hmac-sha256") else {
        return msg_response(StatusCode::UNAUTHORIZED, "Missing Shopify HMAC header");
    };
    if !verify_webhook_hmac(state.webhook_secret.as_bytes(), &body, signature) {
        return msg_response(StatusCode::UNAUTHORIZED, "Invalid Shopify HMAC");
    }

    let Some(shop_domain) = header_str(&headers, "x-shopify-shop-domain") else {
        return msg_response(StatusCode::BAD_REQUEST, "Missing shop domain header");
    };
    let Some(topic) = header_str(&headers, "x-shopify-topic") else {
        return msg_response(StatusCode::BAD_REQUEST, "Missing topic header");
    };

    let tenant = match db::get_tenant_by_shop(&state.pool, shop_domain).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => return msg_response(StatusCode::NOT_FOUND, "Tenant not found"),
        Err(err) => {
            error!(?err, shop_domain, "tenant lookup failed");
            return msg_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    match topic {
        "orders/create" => {
            let order: WebhookOrder = match serde_json::from_slice(&body) {
                Ok(order) => order,
                Err(err) => {
                    warn!(?err, shop_domain, "undecodable orders/create payload");
                    return msg_response(StatusCode::BAD_REQUEST, "Malformed payload");
                }
            };
            if let Err(err) = apply_order_create(&state.pool, &tenant.id, order).await {
                error!(?err, tenant_id = %tenant.id, "failed to apply orders/create");
                return msg_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        }
        other => {
            // Acknowledge unknown topics so Shopify does not retry them.
            info!(topic = other, shop_domain, "unhandled webhook topic");
        }
    }

    (StatusCode::OK, "ok").into_response()
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

/// Shopify REST webhook wire format (snake_case, money fields as strings).
#[derive(Debug, Deserialize)]
pub struct WebhookOrder {
    pub id: i64,
    #[serde(default)]
    pub order_number: i64,
    pub total_price: Option<String>,
    pub currency: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub customer: Option<WebhookCustomer>,
    #[serde(default)]
    pub line_items: Vec<WebhookLineItem>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookCustomer {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub total_spent: Option<String>,
    pub orders_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookLineItem {
    pub product_id: Option<i64>,
    pub title: Option<String>,
    pub vendor: Option<String>,
}

/// Map an orders/create event onto the same idempotent upsert contracts the
/// batch pipeline uses: embedded customer, order row, line-item products.
async fn apply_order_create(
    pool: &Pool,
    tenant_id: &str,
    order: WebhookOrder,
) -> anyhow::Result<()> {
    let customer = order.customer.map(|customer| CustomerRecord {
        id: customer.id,
        first_name: customer.first_name,
        last_name: customer.last_name,
        email: customer.email,
        total_spent: customer
            .total_spent
            .as_deref()
            .and_then(|amount| amount.parse().ok())
            .unwrap_or(0.0),
        orders_count: customer.orders_count.unwrap_or(0),
    });
    let record = OrderRecord {
        id: order.id,
        order_number: order.order_number,
        total_price: order
            .total_price
            .as_deref()
            .and_then(|amount| amount.parse().ok())
            .unwrap_or(0.0),
        currency: order.currency.unwrap_or_else(|| "USD".to_string()),
        created_at: order.created_at,
        customer,
    };
    db::upsert_orders(pool, tenant_id, &[record]).await?;

    let products: Vec<ProductRecord> = order
        .line_items
        .into_iter()
        .filter_map(|item| {
            item.product_id.map(|product_id| ProductRecord {
                id: product_id,
                title: item.title.unwrap_or_default(),
                body_html: None,
                vendor: item.vendor,
                product_type: None,
                created_at: None,
            })
        })
        .collect();
    if !products.is_empty() {
        db::upsert_products(pool, tenant_id, &products).await?;
    }
    Ok(())
}
