//! The slice of the product catalog needed to work out which remote listings a
//! local change touches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Amazon,
    Shopify,
    Magento,
    Woocommerce,
    Shein,
    Ebay,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Amazon => "amazon",
            IntegrationKind::Shopify => "shopify",
            IntegrationKind::Magento => "magento",
            IntegrationKind::Woocommerce => "woocommerce",
            IntegrationKind::Shein => "shein",
            IntegrationKind::Ebay => "ebay",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "amazon" => Some(IntegrationKind::Amazon),
            "shopify" => Some(IntegrationKind::Shopify),
            "magento" => Some(IntegrationKind::Magento),
            "woocommerce" | "woo_commerce" => Some(IntegrationKind::Woocommerce),
            "shein" => Some(IntegrationKind::Shein),
            "ebay" => Some(IntegrationKind::Ebay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SalesChannel {
    pub id: i64,
    pub company_id: String,
    pub name: String,
    pub integration: IntegrationKind,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSalesChannel {
    pub name: String,
    pub integration: IntegrationKind,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A marketplace or storefront reachable through a sales channel.
#[derive(Debug, Clone, Serialize)]
pub struct SalesChannelView {
    pub id: i64,
    pub sales_channel_id: i64,
    pub name: String,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSalesChannelView {
    pub name: String,
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// Mirror of a local product inside one sales channel. Variations point at
/// the remote product of their configurable parent.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteProduct {
    pub id: i64,
    pub sales_channel_id: i64,
    pub local_product_id: i64,
    pub remote_sku: Option<String>,
    pub remote_parent_product_id: Option<i64>,
    pub is_variation: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRemoteProduct {
    pub local_product_id: i64,
    #[serde(default)]
    pub remote_sku: Option<String>,
    #[serde(default)]
    pub remote_parent_product_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewAssignment {
    pub id: i64,
    pub product_id: i64,
    pub sales_channel_view_id: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_names_are_stable() {
        assert_eq!(IntegrationKind::parse("WooCommerce"), Some(IntegrationKind::Woocommerce));
        assert_eq!(IntegrationKind::parse("ebay"), Some(IntegrationKind::Ebay));
        assert_eq!(IntegrationKind::parse("etsy"), None);
        assert_eq!(IntegrationKind::Shein.as_str(), "shein");
    }

    #[test]
    fn channels_default_to_active() {
        let input: NewSalesChannel =
            serde_json::from_str(r#"{"name":"EU store","integration":"shopify"}"#).expect("parse");
        assert!(input.active);
        assert_eq!(input.integration, IntegrationKind::Shopify);
    }
}
