//! Variant reconciliation.
//!
//! Every delivery re-derives each variant's state from its stock and image:
//! eligible variants are rendered and stored when their fingerprint moved or
//! the artifact is missing, ineligible ones have their artifacts removed, and
//! unclassified ones are left alone entirely.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use reqwest::Client;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{BackendError, SyncBackend},
    fingerprint::{self, Fingerprint, FingerprintStore},
    models::{ChangeEvent, Product, Summary, Variant},
    placement::{self, ArtifactKey},
    render::{self, ArtifactRenderer, RenderError},
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image request failed: {0}")]
    Request(String),
    #[error("image request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("image fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    #[error("backend {op} failed for {key}: {source}")]
    Sync {
        op: &'static str,
        key: String,
        #[source]
        source: BackendError,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ReconcileError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Configuration(_))
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpImageSource {
    http: Client,
}

impl HttpImageSource {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        response
            .bytes()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Treat an unfetchable image like a missing one and remove the artifact.
    pub delete_on_fetch_error: bool,
    pub concurrency: usize,
    pub prune_empty_containers: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            delete_on_fetch_error: true,
            concurrency: 4,
            prune_empty_containers: true,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    backend: Arc<dyn SyncBackend>,
    fingerprints: Arc<dyn FingerprintStore>,
    images: Arc<dyn ImageSource>,
    renderer: ArtifactRenderer,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        fingerprints: Arc<dyn FingerprintStore>,
        images: Arc<dyn ImageSource>,
        renderer: ArtifactRenderer,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            backend,
            fingerprints,
            images,
            renderer,
            options,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Reconciles every variant of an inbound change event.
    pub async fn reconcile(&self, event: ChangeEvent) -> Result<Summary, ReconcileError> {
        self.reconcile_products(&event.into_products()).await
    }

    /// Full sweep over a fetched catalog; unpublished products are skipped.
    pub async fn reconcile_catalog(&self, products: Vec<Product>) -> Result<Summary, ReconcileError> {
        let total = products.len();
        let published = products
            .into_iter()
            .filter(Product::is_published)
            .collect::<Vec<_>>();
        info!(
            target = "vsync.engine",
            total,
            published = published.len(),
            "catalog_sweep_started"
        );
        self.reconcile_products(&published).await
    }

    async fn reconcile_products(&self, products: &[Product]) -> Result<Summary, ReconcileError> {
        let started = Instant::now();
        // Collected eagerly so the returned future stays Send.
        let work = products
            .iter()
            .flat_map(|product| product.variants.iter().map(move |variant| (product, variant)))
            .map(|(product, variant)| self.reconcile_variant(product, variant))
            .collect::<Vec<_>>();
        let mut outcomes = stream::iter(work).buffered(self.options.concurrency.max(1));

        let mut summary = Summary::default();
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(partial) => summary += partial,
                Err(err) => {
                    error!(
                        target = "vsync.engine",
                        error = %err,
                        updated = summary.updated,
                        deleted = summary.deleted,
                        "reconcile_aborted"
                    );
                    return Err(err);
                }
            }
        }
        drop(outcomes);

        if summary.deleted > 0 && self.options.prune_empty_containers {
            match self.backend.prune_empty_containers().await {
                Ok(report) => {
                    debug!(target = "vsync.engine", removed = report.removed, "prune_complete")
                }
                Err(err) => {
                    warn!(target = "vsync.engine", backend = self.backend.name(), error = %err, "prune_failed");
                    summary.errors += 1;
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::reconcile_summary(&summary, elapsed_ms);
        info!(
            target = "vsync.engine",
            products = products.len(),
            updated = summary.updated,
            deleted = summary.deleted,
            skipped = summary.skipped,
            errors = summary.errors,
            elapsed_ms = elapsed_ms as u64,
            "reconcile_complete"
        );
        Ok(summary)
    }

    /// Only fatal errors escape; everything else is logged and counted.
    async fn reconcile_variant(
        &self,
        product: &Product,
        variant: &Variant,
    ) -> Result<Summary, ReconcileError> {
        let placements = placement::resolve(product, variant);
        if placements.is_empty() {
            debug!(target = "vsync.engine", product_id = product.id, variant_id = variant.id, "variant_unclassified");
            return Ok(Summary::default());
        }
        let keys = placements
            .iter()
            .map(|placement| placement.key(variant.id))
            .collect::<Vec<_>>();

        let mut summary = Summary::default();
        let image_url = product.image_src(variant.image_id);
        let source = match (variant.in_stock(), image_url) {
            (true, Some(url)) => match self.images.fetch(url).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    let err = ReconcileError::from(err);
                    warn!(target = "vsync.engine", variant_id = variant.id, url = %url, error = %err, "image_fetch_failed");
                    summary.errors += 1;
                    if !self.options.delete_on_fetch_error {
                        return Ok(summary);
                    }
                    None
                }
            },
            _ => None,
        };

        summary += match source {
            Some(bytes) => self.sync_eligible(variant, &keys, bytes).await?,
            None => self.remove_ineligible(variant, &keys).await?,
        };
        Ok(summary)
    }

    async fn sync_eligible(
        &self,
        variant: &Variant,
        keys: &[ArtifactKey],
        source: Bytes,
    ) -> Result<Summary, ReconcileError> {
        let mut summary = Summary::default();
        let badge = match render::badge_text(&variant.price) {
            Ok(badge) => badge,
            Err(err) => {
                warn!(target = "vsync.engine", variant_id = variant.id, error = %err, "render_failed");
                summary.errors += 1;
                return Ok(summary);
            }
        };
        let fingerprint = Fingerprint::of_parts(&[&source[..], badge.as_bytes()]);

        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            let present = match self.backend.exists(key).await {
                Ok(present) => present,
                Err(err) => {
                    self.backend_failure("exists", key, err)?;
                    summary.errors += 1;
                    continue;
                }
            };
            if present
                && !fingerprint::has_changed(self.fingerprints.as_ref(), key, &fingerprint).await
            {
                debug!(target = "vsync.engine", variant_id = variant.id, key = %key, "artifact_unchanged");
                summary.skipped += 1;
                continue;
            }
            pending.push(key);
        }
        if pending.is_empty() {
            return Ok(summary);
        }

        let rendered = match self
            .renderer
            .render(source.to_vec(), variant.price.clone())
            .await
        {
            Ok(rendered) => Bytes::from(rendered),
            Err(err) => {
                warn!(target = "vsync.engine", variant_id = variant.id, error = %err, "render_failed");
                summary.errors += 1;
                return Ok(summary);
            }
        };

        for key in pending {
            match self.backend.put(key, rendered.clone()).await {
                Ok(location) => {
                    if let Err(err) = self.fingerprints.record(key, &fingerprint).await {
                        warn!(target = "vsync.engine", key = %key, error = %err, "fingerprint_record_failed");
                    }
                    info!(target = "vsync.engine", variant_id = variant.id, key = %key, location = %location, "artifact_updated");
                    summary.updated += 1;
                }
                Err(err) => {
                    self.backend_failure("put", key, err)?;
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn remove_ineligible(
        &self,
        variant: &Variant,
        keys: &[ArtifactKey],
    ) -> Result<Summary, ReconcileError> {
        let mut summary = Summary::default();
        for key in keys {
            match self.backend.exists(key).await {
                Ok(false) => {}
                Ok(true) => match self.backend.delete(key).await {
                    Ok(()) => {
                        self.forget(key).await;
                        info!(target = "vsync.engine", variant_id = variant.id, key = %key, "artifact_deleted");
                        summary.deleted += 1;
                    }
                    Err(err) if err.is_not_found() => self.forget(key).await,
                    Err(err) => {
                        self.backend_failure("delete", key, err)?;
                        summary.errors += 1;
                    }
                },
                Err(err) => {
                    self.backend_failure("exists", key, err)?;
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn forget(&self, key: &ArtifactKey) {
        if let Err(err) = self.fingerprints.forget(key).await {
            warn!(target = "vsync.engine", key = %key, error = %err, "fingerprint_forget_failed");
        }
    }

    /// Logs a non-fatal backend failure; credential rejections abort the event.
    fn backend_failure(
        &self,
        op: &'static str,
        key: &ArtifactKey,
        err: BackendError,
    ) -> Result<(), ReconcileError> {
        if err.is_fatal() {
            return Err(ReconcileError::Configuration(format!(
                "{} backend rejected credentials: {err}",
                self.backend.name()
            )));
        }
        let err = ReconcileError::Sync {
            op,
            key: key.to_string(),
            source: err,
        };
        warn!(target = "vsync.engine", error = %err, "backend_operation_failed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::PruneReport;
    use reqwest::StatusCode;
    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::Mutex,
    };

    #[derive(Default)]
    pub struct RecordingBackend {
        pub objects: Mutex<BTreeMap<String, Bytes>>,
        pub puts: Mutex<Vec<String>>,
        pub deletes: Mutex<Vec<String>>,
        pub exists_calls: Mutex<usize>,
        pub prunes: Mutex<usize>,
        pub failing_puts: Mutex<HashSet<String>>,
        pub reject_credentials: Mutex<bool>,
    }

    impl RecordingBackend {
        pub fn put_count(&self) -> usize {
            self.puts.lock().unwrap().len()
        }

        pub fn delete_count(&self) -> usize {
            self.deletes.lock().unwrap().len()
        }

        pub fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        fn check_credentials(&self) -> Result<(), BackendError> {
            if *self.reject_credentials.lock().unwrap() {
                return Err(BackendError::Unauthorized(StatusCode::FORBIDDEN));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SyncBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn put(&self, key: &ArtifactKey, bytes: Bytes) -> Result<String, BackendError> {
            self.check_credentials()?;
            if self.failing_puts.lock().unwrap().contains(key.as_str()) {
                return Err(BackendError::Request("injected failure".into()));
            }
            self.puts.lock().unwrap().push(key.to_string());
            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            Ok(format!("memory://{key}"))
        }

        async fn delete(&self, key: &ArtifactKey) -> Result<(), BackendError> {
            self.check_credentials()?;
            self.deletes.lock().unwrap().push(key.to_string());
            match self.objects.lock().unwrap().remove(key.as_str()) {
                Some(_) => Ok(()),
                None => Err(BackendError::NotFound(key.to_string())),
            }
        }

        async fn exists(&self, key: &ArtifactKey) -> Result<bool, BackendError> {
            self.check_credentials()?;
            *self.exists_calls.lock().unwrap() += 1;
            Ok(self.objects.lock().unwrap().contains_key(key.as_str()))
        }

        async fn prune_empty_containers(&self) -> Result<PruneReport, BackendError> {
            *self.prunes.lock().unwrap() += 1;
            Ok(PruneReport::default())
        }
    }

    /// Serves canned bytes per URL; unknown URLs fail like a 404.
    #[derive(Default)]
    pub struct StaticImages {
        pub images: Mutex<HashMap<String, Result<Bytes, u16>>>,
        pub fetches: Mutex<usize>,
    }

    impl StaticImages {
        pub fn serve(&self, url: &str, bytes: Vec<u8>) {
            self.images
                .lock()
                .unwrap()
                .insert(url.to_string(), Ok(Bytes::from(bytes)));
        }

        pub fn fail(&self, url: &str, status: u16) {
            self.images
                .lock()
                .unwrap()
                .insert(url.to_string(), Err(status));
        }
    }

    #[async_trait]
    impl ImageSource for StaticImages {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            *self.fetches.lock().unwrap() += 1;
            match self.images.lock().unwrap().get(url).cloned() {
                Some(Ok(bytes)) => Ok(bytes),
                Some(Err(status)) => Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                }),
                None => Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingBackend, StaticImages};
    use super::*;
    use crate::{
        backend::LocalBackend,
        fingerprint::MemoryFingerprints,
        render::{RenderConfig, solid_png},
    };
    use serde_json::json;

    const IMAGE_URL: &str = "http://x/img.jpg";

    struct Harness {
        backend: Arc<RecordingBackend>,
        images: Arc<StaticImages>,
        reconciler: Reconciler,
    }

    fn harness_with(options: ReconcileOptions) -> Harness {
        let backend = Arc::new(RecordingBackend::default());
        let images = Arc::new(StaticImages::default());
        images.serve(IMAGE_URL, solid_png(200, 200, [255, 255, 255]));
        let reconciler = Reconciler::new(
            backend.clone(),
            Arc::new(MemoryFingerprints::new()),
            images.clone(),
            ArtifactRenderer::new(&RenderConfig {
                jpeg_quality: 90,
                ..Default::default()
            }),
            options,
        );
        Harness {
            backend,
            images,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(ReconcileOptions {
            concurrency: 1,
            ..Default::default()
        })
    }

    fn event(tags: &str, inventory: i64, price: &str, image_id: i64) -> ChangeEvent {
        serde_json::from_value(json!({
            "id": 1,
            "tags": tags,
            "published_at": "2024-01-01T00:00:00Z",
            "variants": [{
                "id": 100,
                "image_id": image_id,
                "inventory_quantity": inventory,
                "price": price,
                "option1": "M",
                "option2": "Blue",
                "option3": null
            }],
            "images": [{ "id": 9, "src": IMAGE_URL }]
        }))
        .unwrap()
    }

    fn summary(updated: u32, deleted: u32, skipped: u32, errors: u32) -> Summary {
        Summary {
            updated,
            deleted,
            skipped,
            errors,
        }
    }

    #[tokio::test]
    async fn first_delivery_renders_and_puts_badged_image() {
        let h = harness();
        let result = h
            .reconciler
            .reconcile(event("girls,new", 5, "129.00", 9))
            .await
            .unwrap();
        assert_eq!(result, summary(1, 0, 0, 0));
        assert_eq!(h.backend.keys(), vec!["M/girls/100.jpg"]);

        let stored = h.backend.objects.lock().unwrap()["M/girls/100.jpg"].clone();
        let expected = h
            .reconciler
            .renderer
            .render_blocking(&solid_png(200, 200, [255, 255, 255]), "129")
            .unwrap();
        // Same badge text, same deterministic encoding.
        assert_eq!(stored.as_ref(), expected.as_slice());
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let h = harness();
        let first = h.reconciler.reconcile(event("girls", 5, "129.00", 9)).await.unwrap();
        let second = h.reconciler.reconcile(event("girls", 5, "129.00", 9)).await.unwrap();
        assert_eq!(first, summary(1, 0, 0, 0));
        assert_eq!(second, summary(0, 0, 1, 0));
        assert_eq!(h.backend.put_count(), 1);
    }

    #[tokio::test]
    async fn going_out_of_stock_deletes_each_placement_once() {
        let h = harness();
        h.reconciler
            .reconcile(event("girls,boys", 5, "129.00", 9))
            .await
            .unwrap();
        assert_eq!(h.backend.put_count(), 2);

        let removed = h.reconciler.reconcile(event("girls,boys", 0, "129.00", 9)).await.unwrap();
        assert_eq!(removed, summary(0, 2, 0, 0));
        assert_eq!(
            *h.backend.deletes.lock().unwrap(),
            vec!["M/girls/100.jpg", "M/boys/100.jpg"]
        );

        let again = h.reconciler.reconcile(event("girls,boys", 0, "129.00", 9)).await.unwrap();
        assert_eq!(again, Summary::default());
        assert_eq!(h.backend.delete_count(), 2);
        assert_eq!(*h.backend.prunes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn placements_are_written_girls_then_boys() {
        let h = harness();
        h.reconciler
            .reconcile(event("boys,girls", 3, "50", 9))
            .await
            .unwrap();
        assert_eq!(
            *h.backend.puts.lock().unwrap(),
            vec!["M/girls/100.jpg", "M/boys/100.jpg"]
        );
    }

    #[tokio::test]
    async fn unclassified_variants_are_never_touched() {
        let h = harness();
        h.backend
            .objects
            .lock()
            .unwrap()
            .insert("M/girls/100.jpg".into(), Bytes::from_static(b"old"));

        for inventory in [5, 0] {
            let result = h
                .reconciler
                .reconcile(event("sale,new", inventory, "10", 9))
                .await
                .unwrap();
            assert_eq!(result, Summary::default());
        }
        assert_eq!(*h.backend.exists_calls.lock().unwrap(), 0);
        assert_eq!(*h.images.fetches.lock().unwrap(), 0);
        assert_eq!(h.backend.keys(), vec!["M/girls/100.jpg"]);
    }

    // Known limitation: dropping the last audience tag strands the old artifact.
    #[tokio::test]
    async fn retagged_variant_keeps_stale_artifact() {
        let h = harness();
        h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        h.reconciler.reconcile(event("new", 0, "10", 9)).await.unwrap();
        assert_eq!(h.backend.keys(), vec!["M/girls/100.jpg"]);
        assert_eq!(h.backend.delete_count(), 0);
    }

    #[tokio::test]
    async fn price_change_rerenders() {
        let h = harness();
        h.reconciler.reconcile(event("girls", 5, "129.00", 9)).await.unwrap();
        let repriced = h.reconciler.reconcile(event("girls", 5, "99.00", 9)).await.unwrap();
        assert_eq!(repriced, summary(1, 0, 0, 0));
        // Same integer badge, no new work.
        let same_badge = h.reconciler.reconcile(event("girls", 5, "99.50", 9)).await.unwrap();
        assert_eq!(same_badge, summary(0, 0, 1, 0));
        assert_eq!(h.backend.put_count(), 2);
    }

    #[tokio::test]
    async fn source_image_change_rerenders() {
        let h = harness();
        h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        h.images.serve(IMAGE_URL, solid_png(200, 200, [0, 0, 0]));
        let result = h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        assert_eq!(result, summary(1, 0, 0, 0));
    }

    #[tokio::test]
    async fn artifact_removed_remotely_is_recreated() {
        let h = harness();
        h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        h.backend.objects.lock().unwrap().clear();
        let result = h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        assert_eq!(result, summary(1, 0, 0, 0));
    }

    #[tokio::test]
    async fn unresolvable_image_deletes() {
        let h = harness();
        h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        let result = h.reconciler.reconcile(event("girls", 5, "10", 404)).await.unwrap();
        assert_eq!(result, summary(0, 1, 0, 0));
        assert!(h.backend.keys().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_deletes_by_default() {
        let h = harness();
        h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        h.images.fail(IMAGE_URL, 503);
        let result = h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        assert_eq!(result, summary(0, 1, 0, 1));
        assert!(h.backend.keys().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_keeps_artifact_when_configured() {
        let h = harness_with(ReconcileOptions {
            delete_on_fetch_error: false,
            concurrency: 1,
            prune_empty_containers: true,
        });
        h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        h.images.fail(IMAGE_URL, 503);
        let result = h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        assert_eq!(result, summary(0, 0, 0, 1));
        assert_eq!(h.backend.keys(), vec!["M/girls/100.jpg"]);
    }

    #[tokio::test]
    async fn render_failure_is_retried_on_next_delivery() {
        let h = harness();
        h.images.serve(IMAGE_URL, b"corrupt".to_vec());
        let failed = h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        assert_eq!(failed, summary(0, 0, 0, 1));
        assert_eq!(h.backend.put_count(), 0);

        h.images.serve(IMAGE_URL, solid_png(200, 200, [255, 255, 255]));
        let retried = h.reconciler.reconcile(event("girls", 5, "10", 9)).await.unwrap();
        assert_eq!(retried, summary(1, 0, 0, 0));
    }

    #[tokio::test]
    async fn invalid_price_counts_as_render_error() {
        let h = harness();
        let result = h.reconciler.reconcile(event("girls", 5, "n/a", 9)).await.unwrap();
        assert_eq!(result, summary(0, 0, 0, 1));
        assert_eq!(h.backend.put_count(), 0);
    }

    #[tokio::test]
    async fn one_failing_variant_does_not_stop_the_rest() {
        let h = harness_with(ReconcileOptions::default());
        h.backend
            .failing_puts
            .lock()
            .unwrap()
            .insert("M/girls/100.jpg".into());
        let batch: ChangeEvent = serde_json::from_value(json!({
            "products": [
                {
                    "id": 1, "tags": "girls",
                    "variants": [{ "id": 100, "image_id": 9, "inventory_quantity": 1, "price": "10", "option1": "M" }],
                    "images": [{ "id": 9, "src": IMAGE_URL }]
                },
                {
                    "id": 2, "tags": "boys",
                    "variants": [
                        { "id": 200, "image_id": 9, "inventory_quantity": 1, "price": "20", "option1": "XL" },
                        { "id": 201, "image_id": 9, "inventory_quantity": 1, "price": "20", "option1": "7-8Y" }
                    ],
                    "images": [{ "id": 9, "src": IMAGE_URL }]
                }
            ]
        }))
        .unwrap();
        let result = h.reconciler.reconcile(batch).await.unwrap();
        assert_eq!(result, summary(2, 0, 0, 1));
        assert_eq!(h.backend.keys(), vec!["7-8Y/boys/201.jpg", "XL/boys/200.jpg"]);
    }

    #[tokio::test]
    async fn rejected_credentials_abort_the_event() {
        let h = harness();
        *h.backend.reject_credentials.lock().unwrap() = true;
        let err = h
            .reconciler
            .reconcile(event("girls", 5, "10", 9))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn catalog_sweep_skips_unpublished_products() {
        let h = harness();
        let products: Vec<Product> = serde_json::from_value(json!([
            {
                "id": 1, "tags": "girls", "published_at": "2024-01-01T00:00:00Z",
                "variants": [{ "id": 100, "image_id": 9, "inventory_quantity": 1, "price": "10", "option1": "S" }],
                "images": [{ "id": 9, "src": IMAGE_URL }]
            },
            {
                "id": 2, "tags": "girls", "published_at": null,
                "variants": [{ "id": 200, "image_id": 9, "inventory_quantity": 1, "price": "10", "option1": "S" }],
                "images": [{ "id": 9, "src": IMAGE_URL }]
            }
        ]))
        .unwrap();
        let result = h.reconciler.reconcile_catalog(products).await.unwrap();
        assert_eq!(result, summary(1, 0, 0, 0));
        assert_eq!(h.backend.keys(), vec!["S/girls/100.jpg"]);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn reconcile_futures_are_send() {
        let h = harness();
        let webhook = h.reconciler.reconcile(event("girls", 5, "10", 9));
        assert_send(&webhook);
        let sweep = h.reconciler.reconcile_catalog(Vec::new());
        assert_send(&sweep);
    }

    fn reconciler_over(backend: Arc<dyn SyncBackend>) -> Reconciler {
        let images = Arc::new(StaticImages::default());
        images.serve(IMAGE_URL, solid_png(200, 200, [255, 255, 255]));
        Reconciler::new(
            backend,
            Arc::new(MemoryFingerprints::new()),
            images,
            ArtifactRenderer::new(&RenderConfig::default()),
            ReconcileOptions {
                concurrency: 4,
                ..Default::default()
            },
        )
    }

    /// Two in-stock variants that land in the same fresh `M/girls` container.
    fn sibling_event(inventory: i64) -> ChangeEvent {
        let variant = |id: i64| {
            json!({
                "id": id, "image_id": 9, "inventory_quantity": inventory,
                "price": "10", "option1": "M"
            })
        };
        serde_json::from_value(json!({
            "id": 1,
            "tags": "girls",
            "published_at": "2024-01-01T00:00:00Z",
            "variants": [variant(100), variant(101)],
            "images": [{ "id": 9, "src": IMAGE_URL }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn concurrent_variants_share_one_drive_folder_per_level() {
        let (drive, backend) = crate::backend::drive::testing::spawn_fake().await;
        let reconciler = reconciler_over(Arc::new(backend));

        let result = reconciler.reconcile(sibling_event(3)).await.unwrap();
        assert_eq!(result, summary(2, 0, 0, 0));
        assert_eq!(
            drive.paths(),
            vec!["/root", "M/girls", "girls/100.jpg", "girls/101.jpg", "root/M"]
        );

        let fresh = drive.backend();
        for key in ["M/girls/100.jpg", "M/girls/101.jpg"] {
            assert!(fresh.exists(&ArtifactKey::from(key)).await.unwrap(), "{key}");
        }
    }

    #[tokio::test]
    async fn concurrent_variants_on_local_disk_then_prune() {
        let dir = tempfile::TempDir::new().unwrap();
        let reconciler = reconciler_over(Arc::new(LocalBackend::new(dir.path())));

        let result = reconciler.reconcile(sibling_event(3)).await.unwrap();
        assert_eq!(result, summary(2, 0, 0, 0));
        let mut stored = std::fs::read_dir(dir.path().join("M").join("girls"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        stored.sort();
        assert_eq!(stored, vec!["100.jpg", "101.jpg"]);
        let fresh = LocalBackend::new(dir.path());
        assert!(fresh.exists(&ArtifactKey::from("M/girls/101.jpg")).await.unwrap());

        let removed = reconciler.reconcile(sibling_event(0)).await.unwrap();
        assert_eq!(removed, summary(0, 2, 0, 0));
        assert!(!dir.path().join("M").exists());
        assert!(dir.path().exists());
    }
}
