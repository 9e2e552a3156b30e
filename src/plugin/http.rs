//! HTTP client construction per portal security mode.

use super::PluginError;
use crate::model::SecurityMode;
use std::time::Duration;

/// Build a client for one portal. `trust_all` portals run self-signed
/// certificates; `not_encrypted` portals speak plain HTTP, which needs no
/// special handling on the client side.
pub fn build_client(
    security: SecurityMode,
    connect_timeout: Duration,
) -> Result<reqwest::Client, PluginError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(concat!("mensa-sync/", env!("CARGO_PKG_VERSION")));

    if security == SecurityMode::TrustAll {
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder.build()?)
}
