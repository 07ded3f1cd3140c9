use crate::models::{Product, Variant};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

pub const DEFAULT_BUCKET: &str = "default";

static SIZE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:XS|S|M|L|XL|XXL|XXXL)\b|\d+").expect("size pattern compiles")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Girls,
    Boys,
}

impl Audience {
    pub fn folder(&self) -> &'static str {
        match self {
            Audience::Girls => "girls",
            Audience::Boys => "boys",
        }
    }
}

/// Audience flags derived from a product's comma-separated tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub girls: bool,
    pub boys: bool,
}

impl Classification {
    pub fn from_tags(tags: &str) -> Self {
        let lowered = tags.to_lowercase();
        let mut flags = Self::default();
        for tag in lowered.split(',').map(str::trim) {
            flags.girls |= tag.contains("girls");
            flags.boys |= tag.contains("boys");
        }
        flags
    }

    /// Audiences in fixed girls-then-boys order.
    pub fn audiences(&self) -> Vec<Audience> {
        let mut out = Vec::with_capacity(2);
        if self.girls {
            out.push(Audience::Girls);
        }
        if self.boys {
            out.push(Audience::Boys);
        }
        out
    }

    pub fn is_classified(&self) -> bool {
        self.girls || self.boys
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placement {
    pub bucket: String,
    pub audience: Audience,
}

impl Placement {
    /// Backend key; always `/`-joined regardless of host platform.
    pub fn key(&self, variant_id: i64) -> ArtifactKey {
        ArtifactKey(format!(
            "{}/{}/{}.jpg",
            self.bucket,
            self.audience.folder(),
            variant_id
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub fn sanitize_segment(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect()
}

/// First option value (in option1..option3 order) carrying a size token.
pub fn size_bucket(options: &[&str]) -> String {
    options
        .iter()
        .find(|value| SIZE_PATTERN.is_match(value))
        .map(|value| sanitize_segment(value))
        .unwrap_or_else(|| DEFAULT_BUCKET.to_string())
}

/// Zero, one or two placements for a variant; empty when the product is unclassified.
pub fn resolve(product: &Product, variant: &Variant) -> Vec<Placement> {
    let classification = Classification::from_tags(&product.tags);
    if !classification.is_classified() {
        return Vec::new();
    }
    let bucket = size_bucket(&variant.options());
    classification
        .audiences()
        .into_iter()
        .map(|audience| Placement {
            bucket: bucket.clone(),
            audience,
        })
        .collect()
}
