use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Shared outbound client for image downloads, the catalog and remote backends.
pub fn build_client(timeout: Duration, connect_timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .user_agent(concat!("variant-sync-rs/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|err| {
            warn!(target = "vsync.http", error = %err, "client builder failed; using defaults");
            Client::new()
        })
}
