use super::types::SyncType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// A local mutation that may need to be pushed to remote sales channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    ProductUpdated {
        product_id: i64,
    },
    PropertyUpdated {
        product_id: i64,
        property_id: i64,
    },
    PriceUpdated {
        product_id: i64,
        #[serde(default)]
        currency: Option<String>,
    },
    ContentUpdated {
        product_id: i64,
        #[serde(default)]
        language: Option<String>,
    },
    EanUpdated {
        product_id: i64,
        #[serde(default)]
        ean: Option<String>,
    },
    ImagesUpdated {
        product_id: i64,
        #[serde(default)]
        image_id: Option<i64>,
    },
    VariationAdded {
        parent_product_id: i64,
        variation_product_id: i64,
    },
    VariationRemoved {
        parent_product_id: i64,
        variation_product_id: i64,
    },
    ManualResync {
        product_id: i64,
        #[serde(default)]
        view_id: Option<i64>,
    },
}

impl ChangeEvent {
    pub fn sync_type(&self) -> SyncType {
        match self {
            ChangeEvent::ProductUpdated { .. }
            | ChangeEvent::VariationAdded { .. }
            | ChangeEvent::VariationRemoved { .. }
            | ChangeEvent::ManualResync { .. } => SyncType::Product,
            ChangeEvent::PropertyUpdated { .. } => SyncType::Property,
            ChangeEvent::PriceUpdated { .. } => SyncType::Price,
            ChangeEvent::ContentUpdated { .. } => SyncType::Content,
            ChangeEvent::EanUpdated { .. } => SyncType::Ean,
            ChangeEvent::ImagesUpdated { .. } => SyncType::Images,
        }
    }

    /// Local product whose remote listings are affected. Variation membership
    /// changes re-sync the parent.
    pub fn subject_product_id(&self) -> i64 {
        match self {
            ChangeEvent::ProductUpdated { product_id }
            | ChangeEvent::PropertyUpdated { product_id, .. }
            | ChangeEvent::PriceUpdated { product_id, .. }
            | ChangeEvent::ContentUpdated { product_id, .. }
            | ChangeEvent::EanUpdated { product_id, .. }
            | ChangeEvent::ImagesUpdated { product_id, .. }
            | ChangeEvent::ManualResync { product_id, .. } => *product_id,
            ChangeEvent::VariationAdded {
                parent_product_id, ..
            }
            | ChangeEvent::VariationRemoved {
                parent_product_id, ..
            } => *parent_product_id,
        }
    }

    pub fn view_filter(&self) -> Option<i64> {
        match self {
            ChangeEvent::ManualResync { view_id, .. } => *view_id,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::ProductUpdated { .. } => "product_updated",
            ChangeEvent::PropertyUpdated { .. } => "property_updated",
            ChangeEvent::PriceUpdated { .. } => "price_updated",
            ChangeEvent::ContentUpdated { .. } => "content_updated",
            ChangeEvent::EanUpdated { .. } => "ean_updated",
            ChangeEvent::ImagesUpdated { .. } => "images_updated",
            ChangeEvent::VariationAdded { .. } => "variation_added",
            ChangeEvent::VariationRemoved { .. } => "variation_removed",
            ChangeEvent::ManualResync { .. } => "manual_resync",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            ChangeEvent::ProductUpdated { product_id } => format!("product {product_id} updated"),
            ChangeEvent::PropertyUpdated {
                product_id,
                property_id,
            } => format!("property {property_id} of product {product_id} updated"),
            ChangeEvent::PriceUpdated {
                product_id,
                currency,
            } => match currency {
                Some(code) => format!("{code} price of product {product_id} updated"),
                None => format!("price of product {product_id} updated"),
            },
            ChangeEvent::ContentUpdated {
                product_id,
                language,
            } => match language {
                Some(lang) => format!("{lang} content of product {product_id} updated"),
                None => format!("content of product {product_id} updated"),
            },
            ChangeEvent::EanUpdated { product_id, .. } => {
                format!("ean code of product {product_id} updated")
            }
            ChangeEvent::ImagesUpdated { product_id, .. } => {
                format!("images of product {product_id} updated")
            }
            ChangeEvent::VariationAdded {
                parent_product_id,
                variation_product_id,
            } => format!("variation {variation_product_id} added to {parent_product_id}"),
            ChangeEvent::VariationRemoved {
                parent_product_id,
                variation_product_id,
            } => format!("variation {variation_product_id} removed from {parent_product_id}"),
            ChangeEvent::ManualResync { product_id, .. } => {
                format!("manual resync of product {product_id}")
            }
        }
    }

    /// Event specific task arguments; target ids are added by the store.
    pub fn task_kwargs(&self) -> Map<String, Value> {
        let value = match self {
            ChangeEvent::ProductUpdated { product_id }
            | ChangeEvent::ManualResync { product_id, .. } => json!({ "product_id": product_id }),
            ChangeEvent::PropertyUpdated {
                product_id,
                property_id,
            } => json!({ "product_id": product_id, "property_id": property_id }),
            ChangeEvent::PriceUpdated {
                product_id,
                currency,
            } => json!({ "product_id": product_id, "currency": currency }),
            ChangeEvent::ContentUpdated {
                product_id,
                language,
            } => json!({ "product_id": product_id, "language": language }),
            ChangeEvent::EanUpdated { product_id, ean } => {
                json!({ "product_id": product_id, "ean": ean })
            }
            ChangeEvent::ImagesUpdated {
                product_id,
                image_id,
            } => json!({ "product_id": product_id, "image_id": image_id }),
            ChangeEvent::VariationAdded {
                parent_product_id,
                variation_product_id,
            }
            | ChangeEvent::VariationRemoved {
                parent_product_id,
                variation_product_id,
            } => json!({
                "product_id": parent_product_id,
                "variation_product_id": variation_product_id,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}
