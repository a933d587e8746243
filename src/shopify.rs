//! Shopify Admin GraphQL client: one page of one category per call.
//!
//! The worker-facing surface is the `ShopifyApi` trait so tests can inject a
//! recording client; `ShopifyClient` is the reqwest-backed implementation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{CustomerRecord, OrderRecord, ProductRecord};

/// One page of a category's cursor chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

#[derive(Debug, Error)]
pub enum ShopifyError {
    /// Category-level permission denial (e.g. missing PII scope for
    /// customers). Treated as soft completion by the request worker.
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait ShopifyApi: Send + Sync {
    async fn products_page(&self, cursor: Option<&str>)
        -> Result<Page<ProductRecord>, ShopifyError>;
    async fn customers_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<CustomerRecord>, ShopifyError>;
    async fn orders_page(&self, cursor: Option<&str>) -> Result<Page<OrderRecord>, ShopifyError>;
}

/// Builds per-tenant clients from the credentials carried in request jobs.
pub trait ShopifyClientFactory: Send + Sync {
    fn client(&self, shop_name: &str, access_token: &str) -> Arc<dyn ShopifyApi>;
}

#[derive(Debug, Clone)]
pub struct HttpShopifyFactory {
    pub api_version: String,
    pub page_size: u32,
}

impl ShopifyClientFactory for HttpShopifyFactory {
    fn client(&self, shop_name: &str, access_token: &str) -> Arc<dyn ShopifyApi> {
        Arc::new(ShopifyClient::new(
            shop_name,
            access_token,
            &self.api_version,
            self.page_size,
        ))
    }
}

#[derive(Clone)]
pub struct ShopifyClient {
    http: Client,
    endpoint: String,
    access_token: String,
    page_size: u32,
}

impl fmt::Debug for ShopifyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShopifyClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ShopifyClient {
    pub fn new(shop_name: &str, access_token: &str, api_version: &str, page_size: u32) -> Self {
        let http = Client::builder()
            .user_agent("shopsync/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint: format!("https://{shop_name}/admin/api/{api_version}/graphql.json"),
            access_token: access_token.to_string(),
            page_size,
        }
    }

    async fn execute(&self, query: &str, cursor: Option<&str>) -> Result<Value, ShopifyError> {
        let body = json!({ "query": query, "variables": { "cursor": cursor } });
        let res = self
            .http
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(&body)
            .send()
            .await
            .context("failed to reach Shopify")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("shopify error {}: {}", status, body).into());
        }

        let payload: Value = res
            .json()
            .await
            .context("invalid Shopify response JSON")?;
        check_graphql_errors(&payload)?;
        Ok(payload)
    }
}

#[async_trait]
impl ShopifyApi for ShopifyClient {
    async fn products_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<ProductRecord>, ShopifyError> {
        let payload = self.execute(&products_query(self.page_size), cursor).await?;
        parse_connection::<ProductNode, _>(&payload, "products", ProductNode::into_record)
    }

    async fn customers_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<CustomerRecord>, ShopifyError> {
        let payload = self
            .execute(&customers_query(self.page_size), cursor)
            .await?;
        parse_connection::<CustomerNode, _>(&payload, "customers", CustomerNode::into_record)
    }

    async fn orders_page(&self, cursor: Option<&str>) -> Result<Page<OrderRecord>, ShopifyError> {
        let payload = self.execute(&orders_query(self.page_size), cursor).await?;
        parse_connection::<OrderNode, _>(&payload, "orders", OrderNode::into_record)
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn products_query(page_size: u32) -> String {
    format!(
        "query getProducts($cursor: String) {{ \
           products(first: {page_size}, after: $cursor) {{ \
             pageInfo {{ hasNextPage endCursor }} \
             edges {{ node {{ id title descriptionHtml vendor productType createdAt }} }} \
           }} \
         }}"
    )
}

pub fn customers_query(page_size: u32) -> String {
    format!(
        "query getCustomers($cursor: String) {{ \
           customers(first: {page_size}, after: $cursor) {{ \
             pageInfo {{ hasNextPage endCursor }} \
             edges {{ node {{ id firstName lastName email amountSpent {{ amount }} numberOfOrders }} }} \
           }} \
         }}"
    )
}

pub fn orders_query(page_size: u32) -> String {
    format!(
        "query getOrders($cursor: String) {{ \
           orders(first: {page_size}, after: $cursor) {{ \
             pageInfo {{ hasNextPage endCursor }} \
             edges {{ node {{ id name createdAt totalPriceSet {{ shopMoney {{ amount currencyCode }} }} }} }} \
           }} \
         }}"
    )
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Classify GraphQL-level errors: permission denials become
/// `ShopifyError::AccessDenied`, everything else is a hard error.
fn check_graphql_errors(payload: &Value) -> Result<(), ShopifyError> {
    let Some(errors) = payload.get("errors").and_then(|e| e.as_array()) else {
        return Ok(());
    };
    if errors.is_empty() {
        return Ok(());
    }

    let denied = errors.iter().any(|err| {
        let code = err
            .pointer("/extensions/code")
            .and_then(|c| c.as_str())
            .unwrap_or("");
        let message = err.get("message").and_then(|m| m.as_str()).unwrap_or("");
        code == "ACCESS_DENIED" || message.contains("Access denied")
    });

    let summary = errors
        .iter()
        .filter_map(|err| err.get("message").and_then(|m| m.as_str()))
        .collect::<Vec<_>>()
        .join("; ");

    if denied {
        Err(ShopifyError::AccessDenied(summary))
    } else {
        Err(anyhow!("shopify graphql errors: {}", summary).into())
    }
}

fn parse_connection<N, R>(
    payload: &Value,
    key: &str,
    into_record: impl Fn(N) -> Result<R>,
) -> Result<Page<R>, ShopifyError>
where
    N: for<'de> Deserialize<'de>,
{
    let connection = payload
        .pointer(&format!("/data/{key}"))
        .ok_or_else(|| anyhow!("missing {} connection in Shopify response", key))?;
    let wire: Connection<N> = serde_json::from_value(connection.clone())
        .with_context(|| format!("undecodable {key} connection"))?;

    let mut items = Vec::with_capacity(wire.edges.len());
    for edge in wire.edges {
        items.push(into_record(edge.node)?);
    }
    Ok(Page {
        items,
        end_cursor: wire.page_info.end_cursor,
        has_next_page: wire.page_info.has_next_page,
    })
}

/// Extract the trailing numeric id from a `gid://shopify/Type/123` global id.
pub fn parse_gid(gid: &str) -> Result<i64> {
    gid.rsplit('/')
        .next()
        .and_then(|tail| tail.parse::<i64>().ok())
        .ok_or_else(|| anyhow!("unparseable Shopify gid: {}", gid))
}

fn coerce_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn coerce_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[derive(Deserialize)]
struct Connection<N> {
    #[serde(rename = "pageInfo")]
    page_info: PageInfoWire,
    edges: Vec<Edge<N>>,
}

#[derive(Deserialize)]
struct Edge<N> {
    node: N,
}

#[derive(Deserialize)]
struct PageInfoWire {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductNode {
    id: String,
    title: String,
    description_html: Option<String>,
    vendor: Option<String>,
    product_type: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl ProductNode {
    fn into_record(self) -> Result<ProductRecord> {
        Ok(ProductRecord {
            id: parse_gid(&self.id)?,
            title: self.title,
            body_html: self.description_html,
            vendor: self.vendor,
            product_type: self.product_type,
            created_at: self.created_at,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerNode {
    id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    amount_spent: Option<Value>,
    number_of_orders: Option<Value>,
}

impl CustomerNode {
    fn into_record(self) -> Result<CustomerRecord> {
        let amount = self
            .amount_spent
            .as_ref()
            .and_then(|spent| spent.get("amount"));
        Ok(CustomerRecord {
            id: parse_gid(&self.id)?,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            total_spent: coerce_f64(amount),
            orders_count: coerce_i64(self.number_of_orders.as_ref()),
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderNode {
    id: String,
    name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    total_price_set: Option<Value>,
}

impl OrderNode {
    fn into_record(self) -> Result<OrderRecord> {
        let shop_money = self
            .total_price_set
            .as_ref()
            .and_then(|set| set.get("shopMoney"));
        let total_price = coerce_f64(shop_money.and_then(|m| m.get("amount")));
        let currency = shop_money
            .and_then(|m| m.get("currencyCode"))
            .and_then(|c| c.as_str())
            .unwrap_or("USD")
            .to_string();
        // Order names look like "#1001".
        let order_number = self
            .name
            .as_deref()
            .map(|name| name.trim_start_matches('#'))
            .and_then(|digits| digits.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(OrderRecord {
            id: parse_gid(&self.id)?,
            order_number,
            total_price,
            currency,
            created_at: self.created_at,
            customer: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_embed_page_size_and_cursor_variable() {
        let q = products_query(10);
        assert!(q.contains("products(first: 10, after: $cursor)"));
        assert!(q.contains("pageInfo { hasNextPage endCursor }"));

        let q = orders_query(25);
        assert!(q.contains("orders(first: 25"));
        assert!(q.contains("totalPriceSet"));

        let q = customers_query(10);
        assert!(q.contains("amountSpent { amount }"));
    }

    #[test]
    fn gid_parsing() {
        assert_eq!(parse_gid("gid://shopify/Product/632910392").unwrap(), 632910392);
        assert_eq!(parse_gid("gid://shopify/Order/1").unwrap(), 1);
        assert!(parse_gid("gid://shopify/Product/not-a-number").is_err());
    }

    #[test]
    fn parses_order_page() {
        let payload = serde_json::json!({
            "data": {
                "orders": {
                    "pageInfo": { "hasNextPage": true, "endCursor": "abc" },
                    "edges": [
                        { "node": {
                            "id": "gid://shopify/Order/900",
                            "name": "#1001",
                            "createdAt": "2024-01-02T03:04:05Z",
                            "totalPriceSet": { "shopMoney": { "amount": "19.99", "currencyCode": "EUR" } }
                        } }
                    ]
                }
            }
        });
        let page =
            parse_connection::<OrderNode, _>(&payload, "orders", OrderNode::into_record).unwrap();
        assert!(page.has_next_page);
        assert_eq!(page.end_cursor.as_deref(), Some("abc"));
        assert_eq!(page.items.len(), 1);
        let order = &page.items[0];
        assert_eq!(order.id, 900);
        assert_eq!(order.order_number, 1001);
        assert_eq!(order.total_price, 19.99);
        assert_eq!(order.currency, "EUR");
    }

    #[test]
    fn parses_customer_page_with_string_counts() {
        let payload = serde_json::json!({
            "data": {
                "customers": {
                    "pageInfo": { "hasNextPage": false, "endCursor": null },
                    "edges": [
                        { "node": {
                            "id": "gid://shopify/Customer/7",
                            "firstName": "Ada",
                            "lastName": null,
                            "email": "ada@example.com",
                            "amountSpent": { "amount": "120.50" },
                            "numberOfOrders": "4"
                        } }
                    ]
                }
            }
        });
        let page =
            parse_connection::<CustomerNode, _>(&payload, "customers", CustomerNode::into_record)
                .unwrap();
        assert!(!page.has_next_page);
        let customer = &page.items[0];
        assert_eq!(customer.id, 7);
        assert_eq!(customer.total_spent, 120.50);
        assert_eq!(customer.orders_count, 4);
    }

    #[test]
    fn classifies_access_denied() {
        let payload = serde_json::json!({
            "errors": [
                { "message": "Access denied for customers field.",
                  "extensions": { "code": "ACCESS_DENIED" } }
            ]
        });
        match check_graphql_errors(&payload) {
            Err(ShopifyError::AccessDenied(msg)) => assert!(msg.contains("customers")),
            other => panic!("expected AccessDenied, got {other:?}"),
        }

        let payload = serde_json::json!({
            "errors": [ { "message": "Throttled" } ]
        });
        assert!(matches!(
            check_graphql_errors(&payload),
            Err(ShopifyError::Other(_))
        ));

        assert!(check_graphql_errors(&serde_json::json!({ "data": {} })).is_ok());
    }
}
