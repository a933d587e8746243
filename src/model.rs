use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three synchronized data types. Each contributes exactly one
/// completion signal per cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Products,
    Customers,
    Orders,
}

/// Number of categories a cycle fans out to; the completion counter starts here.
pub const CATEGORY_COUNT: i64 = 3;

impl Category {
    pub const ALL: [Category; 3] = [Category::Products, Category::Customers, Category::Orders];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Products => "products",
            Category::Customers => "customers",
            Category::Orders => "orders",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub user_id: String,
    pub shop_name: String,
    pub access_token: String,
    pub syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Product as returned by the Shopify Admin API, keyed by its stable numeric id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: i64,
    pub title: String,
    pub body_html: Option<String>,
    pub vendor: Option<String>,
    pub product_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub total_spent: f64,
    pub orders_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: i64,
    pub order_number: i64,
    pub total_price: f64,
    pub currency: String,
    pub created_at: Option<DateTime<Utc>>,
    pub customer: Option<CustomerRecord>,
}

/// Jobs on `syncReqQueue`: one per category per cycle, carrying the tenant's
/// offline credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum RequestJob {
    #[serde(rename = "syncProducts", rename_all = "camelCase")]
    SyncProducts {
        tenant_id: String,
        shop_name: String,
        access_token: String,
    },
    #[serde(rename = "syncCustomers", rename_all = "camelCase")]
    SyncCustomers {
        tenant_id: String,
        shop_name: String,
        access_token: String,
    },
    #[serde(rename = "syncOrders", rename_all = "camelCase")]
    SyncOrders {
        tenant_id: String,
        shop_name: String,
        access_token: String,
    },
}

impl RequestJob {
    pub fn new(category: Category, tenant_id: &str, shop_name: &str, access_token: &str) -> Self {
        let (tenant_id, shop_name, access_token) = (
            tenant_id.to_string(),
            shop_name.to_string(),
            access_token.to_string(),
        );
        match category {
            Category::Products => RequestJob::SyncProducts {
                tenant_id,
                shop_name,
                access_token,
            },
            Category::Customers => RequestJob::SyncCustomers {
                tenant_id,
                shop_name,
                access_token,
            },
            Category::Orders => RequestJob::SyncOrders {
                tenant_id,
                shop_name,
                access_token,
            },
        }
    }

    pub fn category(&self) -> Category {
        match self {
            RequestJob::SyncProducts { .. } => Category::Products,
            RequestJob::SyncCustomers { .. } => Category::Customers,
            RequestJob::SyncOrders { .. } => Category::Orders,
        }
    }
}

/// Jobs on `syncDbQueue`: fixed-size batches plus per-category completion
/// signals feeding the fan-in counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum DbSyncJob {
    #[serde(rename = "processProducts", rename_all = "camelCase")]
    ProcessProducts {
        tenant_id: String,
        items: Vec<ProductRecord>,
    },
    #[serde(rename = "processCustomers", rename_all = "camelCase")]
    ProcessCustomers {
        tenant_id: String,
        items: Vec<CustomerRecord>,
    },
    #[serde(rename = "processOrders", rename_all = "camelCase")]
    ProcessOrders {
        tenant_id: String,
        items: Vec<OrderRecord>,
    },
    #[serde(rename = "categorySynced", rename_all = "camelCase")]
    CategorySynced {
        tenant_id: String,
        category: Category,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum AnalyticsJob {
    #[serde(rename = "generateInsights", rename_all = "camelCase")]
    GenerateInsights { tenant_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload")]
pub enum MailJob {
    #[serde(rename = "sendAnalysisEmail", rename_all = "camelCase")]
    SendAnalysisEmail { tenant_id: String },
}

/// Which notification a computed segment maps to. Segments outside the two
/// groups receive nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Campaign {
    Reward,
    Retention,
}

pub fn campaign_for_segment(segment: &str) -> Option<Campaign> {
    match segment {
        "Champions" | "Loyal Customers" => Some(Campaign::Reward),
        "At-Risk" | "Lost" => Some(Campaign::Retention),
        _ => None,
    }
}
