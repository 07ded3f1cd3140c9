use serde::{Deserialize, Deserializer, Serialize};
use std::ops::AddAssign;

/// Inbound webhook payload: either a batch wrapper or a bare product.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChangeEvent {
    Batch { products: Vec<Product> },
    Single(Product),
}

impl ChangeEvent {
    pub fn into_products(self) -> Vec<Product> {
        match self {
            ChangeEvent::Batch { products } => products,
            ChangeEvent::Single(product) => vec![product],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variants: Vec<Variant>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<ProductImage>,
    #[serde(default)]
    pub published_at: Option<String>,
}

impl Product {
    /// Source URL of the image with the given id; first match wins.
    pub fn image_src(&self, image_id: Option<i64>) -> Option<&str> {
        let image_id = image_id?;
        self.images
            .iter()
            .find(|image| image.id == image_id)
            .map(|image| image.src.as_str())
            .filter(|src| !src.trim().is_empty())
    }

    pub fn is_published(&self) -> bool {
        self.published_at
            .as_deref()
            .is_some_and(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductImage {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub src: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub id: i64,
    #[serde(default)]
    pub image_id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub inventory_quantity: i64,
    #[serde(default = "default_price", deserialize_with = "price_text")]
    pub price: String,
    #[serde(default)]
    pub option1: Option<String>,
    #[serde(default)]
    pub option2: Option<String>,
    #[serde(default)]
    pub option3: Option<String>,
}

impl Variant {
    pub fn options(&self) -> [&str; 3] {
        [
            self.option1.as_deref().unwrap_or(""),
            self.option2.as_deref().unwrap_or(""),
            self.option3.as_deref().unwrap_or(""),
        ]
    }

    pub fn in_stock(&self) -> bool {
        self.inventory_quantity > 0
    }
}

fn default_price() -> String {
    "0".to_string()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Prices arrive as strings from the admin API but as numbers from some webhooks.
fn price_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) => text,
        Some(Raw::Number(number)) => number.to_string(),
        None => default_price(),
    })
}

/// Outcome counters for one reconciliation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub updated: u32,
    pub deleted: u32,
    pub skipped: u32,
    pub errors: u32,
}

impl AddAssign for Summary {
    fn add_assign(&mut self, other: Self) {
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
