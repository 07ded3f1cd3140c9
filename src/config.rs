use std::{path::PathBuf, time::Duration};
use thiserror::Error;

use crate::{
    backend::{DriveConfig, S3Config, drive::DEFAULT_API_BASE},
    catalog::CatalogConfig,
    engine::ReconcileOptions,
    render::RenderConfig,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local { root: PathBuf },
    ObjectStore(S3Config),
    Drive(DriveConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintConfig {
    Memory,
    File { path: PathBuf },
    Redis { url: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub port: u16,
    pub backend: BackendConfig,
    pub fingerprints: FingerprintConfig,
    pub render: RenderConfig,
    pub reconcile: ReconcileOptions,
    pub catalog: Option<CatalogConfig>,
    pub admin_keys: Vec<String>,
    pub metrics_key: Option<String>,
    pub queue_capacity: usize,
    pub request_max_bytes: usize,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any name → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let artifact_dir = PathBuf::from(env.or("ARTIFACT_DIR", "artifacts"));

        let backend = match env.or("SYNC_BACKEND", "local").to_ascii_lowercase().as_str() {
            "local" => BackendConfig::Local {
                root: artifact_dir.clone(),
            },
            "object_store" | "r2" | "s3" => BackendConfig::ObjectStore(S3Config {
                endpoint: env.required("R2_ENDPOINT")?,
                bucket: env.required("R2_BUCKET")?,
                region: env.or("R2_REGION", "auto"),
                access_key: env.required("R2_ACCESS_KEY")?,
                secret_key: env.required("R2_SECRET_KEY")?,
                public_url: env.optional("R2_PUBLIC_URL"),
            }),
            "drive" => BackendConfig::Drive(DriveConfig {
                api_base: env.or("DRIVE_API_BASE", DEFAULT_API_BASE),
                access_token: env.required("DRIVE_ACCESS_TOKEN")?,
                root_folder_id: env.required("DRIVE_ROOT_FOLDER_ID")?,
            }),
            other => {
                return Err(ConfigError::Invalid {
                    name: "SYNC_BACKEND",
                    value: other.to_string(),
                    reason: "expected local, object_store or drive".into(),
                });
            }
        };

        let fingerprints = match env.or("FINGERPRINT_STORE", "memory").to_ascii_lowercase().as_str() {
            "memory" => FingerprintConfig::Memory,
            "file" => FingerprintConfig::File {
                path: env
                    .optional("FINGERPRINT_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| artifact_dir.join(".fingerprints.json")),
            },
            "redis" => FingerprintConfig::Redis {
                url: env.required("REDIS_URL")?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "FINGERPRINT_STORE",
                    value: other.to_string(),
                    reason: "expected memory, file or redis".into(),
                });
            }
        };

        let render = RenderConfig {
            font_path: env.optional("FONT_PATH").map(PathBuf::from),
            canvas: env
                .optional("RENDER_CANVAS")
                .map(|raw| parse_canvas(&raw))
                .transpose()?,
            jpeg_quality: env.parsed("JPEG_QUALITY", 90u8)?,
        };
        if !(1..=100).contains(&render.jpeg_quality) {
            return Err(ConfigError::Invalid {
                name: "JPEG_QUALITY",
                value: render.jpeg_quality.to_string(),
                reason: "must be between 1 and 100".into(),
            });
        }

        let reconcile = ReconcileOptions {
            delete_on_fetch_error: env.flag("DELETE_ON_FETCH_ERROR", true)?,
            concurrency: env.positive("RECONCILE_CONCURRENCY", 4)?,
            prune_empty_containers: env.flag("PRUNE_EMPTY_CONTAINERS", true)?,
        };

        let catalog = match env.optional("SHOPIFY_STORE_URL") {
            None => None,
            Some(store_url) => Some(CatalogConfig::new(
                store_url,
                env.or("SHOPIFY_API_VERSION", "2024-01"),
                env.optional("SHOPIFY_ACCESS_TOKEN"),
                env.optional("SHOPIFY_API_KEY")
                    .zip(env.optional("SHOPIFY_PASSWORD")),
            )
            .ok_or(ConfigError::Missing(
                "SHOPIFY_ACCESS_TOKEN or SHOPIFY_API_KEY/SHOPIFY_PASSWORD",
            ))?),
        };

        let admin_keys = env
            .optional("SYNC_ADMIN_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            port: env.parsed("PORT", 8000u16)?,
            backend,
            fingerprints,
            render,
            reconcile,
            catalog,
            admin_keys,
            metrics_key: env.optional("METRICS_KEY"),
            queue_capacity: env.positive("QUEUE_CAPACITY", 64)?,
            request_max_bytes: env.positive("REQUEST_MAX_BYTES", 2 * 1024 * 1024)?,
            http_timeout: Duration::from_secs(env.parsed("HTTP_TIMEOUT_SECS", 15u64)?),
            http_connect_timeout: Duration::from_secs(env.parsed("HTTP_CONNECT_TIMEOUT_SECS", 5u64)?),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn parsed<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: err.to_string(),
            }),
        }
    }

    fn positive(&self, name: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parsed(name, default)?;
        if value == 0 {
            return Err(ConfigError::Invalid {
                name,
                value: value.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(value)
    }

    fn flag(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => parse_env_bool(&raw).ok_or(ConfigError::Invalid {
                name,
                value: raw,
                reason: "expected a boolean".into(),
            }),
        }
    }
}

pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_canvas(raw: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        name: "RENDER_CANVAS",
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let (width, height) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| invalid("expected WIDTHxHEIGHT"))?;
    let width = width.trim().parse::<u32>().map_err(|_| invalid("bad width"))?;
    let height = height.trim().parse::<u32>().map_err(|_| invalid("bad height"))?;
    if width == 0 || height == 0 {
        return Err(invalid("dimensions must be non-zero"));
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        SyncConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_local_backend_with_memory_fingerprints() {
        let cfg = config(&[]).unwrap();
        assert_eq!(
            cfg.backend,
            BackendConfig::Local {
                root: PathBuf::from("artifacts")
            }
        );
        assert_eq!(cfg.fingerprints, FingerprintConfig::Memory);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.render.jpeg_quality, 90);
        assert!(cfg.reconcile.delete_on_fetch_error);
        assert_eq!(cfg.reconcile.concurrency, 4);
        assert_eq!(cfg.request_max_bytes, 2 * 1024 * 1024);
        assert!(cfg.catalog.is_none());
        assert!(cfg.admin_keys.is_empty());
    }

    #[test]
    fn object_store_requires_credentials() {
        let err = config(&[("SYNC_BACKEND", "object_store"), ("R2_ENDPOINT", "https://r2")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("R2_BUCKET"));

        let cfg = config(&[
            ("SYNC_BACKEND", "object_store"),
            ("R2_ENDPOINT", "https://acct.r2.cloudflarestorage.com"),
            ("R2_BUCKET", "variants"),
            ("R2_ACCESS_KEY", "ak"),
            ("R2_SECRET_KEY", "sk"),
        ])
        .unwrap();
        let BackendConfig::ObjectStore(s3) = cfg.backend else {
            panic!("expected object store backend");
        };
        assert_eq!(s3.region, "auto");
        assert_eq!(s3.public_url, None);
    }

    #[test]
    fn drive_backend_uses_default_api_base() {
        let cfg = config(&[
            ("SYNC_BACKEND", "drive"),
            ("DRIVE_ACCESS_TOKEN", "token"),
            ("DRIVE_ROOT_FOLDER_ID", "root123"),
        ])
        .unwrap();
        assert_eq!(
            cfg.backend,
            BackendConfig::Drive(DriveConfig {
                api_base: DEFAULT_API_BASE.into(),
                access_token: "token".into(),
                root_folder_id: "root123".into(),
            })
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(matches!(
            config(&[("SYNC_BACKEND", "ftp")]),
            Err(ConfigError::Invalid { name: "SYNC_BACKEND", .. })
        ));
    }

    #[test]
    fn file_fingerprints_default_under_artifact_dir() {
        let cfg = config(&[("FINGERPRINT_STORE", "file"), ("ARTIFACT_DIR", "/srv/out")]).unwrap();
        assert_eq!(
            cfg.fingerprints,
            FingerprintConfig::File {
                path: PathBuf::from("/srv/out").join(".fingerprints.json")
            }
        );
    }

    #[test]
    fn redis_fingerprints_need_url() {
        assert_eq!(
            config(&[("FINGERPRINT_STORE", "redis")]).unwrap_err(),
            ConfigError::Missing("REDIS_URL")
        );
    }

    #[test]
    fn flags_and_numbers_are_validated() {
        let cfg = config(&[
            ("DELETE_ON_FETCH_ERROR", "off"),
            ("RECONCILE_CONCURRENCY", "8"),
            ("RENDER_CANVAS", "1080x1350"),
            ("SYNC_ADMIN_KEYS", " a , ,b"),
        ])
        .unwrap();
        assert!(!cfg.reconcile.delete_on_fetch_error);
        assert_eq!(cfg.reconcile.concurrency, 8);
        assert_eq!(cfg.render.canvas, Some((1080, 1350)));
        assert_eq!(cfg.admin_keys, vec!["a", "b"]);

        for bad in [
            ("DELETE_ON_FETCH_ERROR", "maybe"),
            ("RECONCILE_CONCURRENCY", "0"),
            ("RENDER_CANVAS", "1080"),
            ("JPEG_QUALITY", "0"),
            ("PORT", "http"),
        ] {
            assert!(config(&[bad]).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn catalog_needs_some_credentials() {
        assert!(config(&[("SHOPIFY_STORE_URL", "https://shop.example")]).is_err());
        let cfg = config(&[
            ("SHOPIFY_STORE_URL", "https://shop.example"),
            ("SHOPIFY_ACCESS_TOKEN", "shpat"),
        ])
        .unwrap();
        assert!(cfg.catalog.is_some());
    }

    #[test]
    fn env_bool_parsing() {
        assert_eq!(parse_env_bool(" YES "), Some(true));
        assert_eq!(parse_env_bool("0"), Some(false));
        assert_eq!(parse_env_bool(""), None);
    }
}
