//! Finding the web wallets a DID has published in its profile `connect` record.

use std::sync::OnceLock;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::registry::PROFILE_PROTOCOL_URI;
use crate::transport::normalize_origin;

/// What the user typed into the wallet field
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletTarget {
    /// A DID whose profile lists its wallets
    Did(String),
    /// A wallet origin given directly
    Wallet(String),
}

const DID_PATTERN: &str = r"(?:[^@]*@)?(did:[a-z0-9]+:[a-zA-Z0-9-]+)";

fn did_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(DID_PATTERN) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                error!(error = %e, "DID pattern failed to compile");
                None
            }
        })
        .as_ref()
}

/// Accepts `did:method:id`, `name@did:method:id`, or an http(s) wallet URL
pub fn parse_wallet_input(input: &str) -> Option<WalletTarget> {
    let input = input.trim();
    let did = did_pattern()
        .and_then(|pattern| pattern.captures(input))
        .and_then(|caps| caps.get(1));
    if let Some(did) = did {
        return Some(WalletTarget::Did(did.as_str().to_string()));
    }
    let url = Url::parse(input).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    normalize_origin(input).map(WalletTarget::Wallet)
}

/// Gateway URL of the `connect` record in `did`'s profile
pub fn connect_record_url(gateway: &str, did: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{}/read/protocols/{}/connect",
        gateway.trim_end_matches('/'),
        did,
        URL_SAFE_NO_PAD.encode(PROFILE_PROTOCOL_URI)
    ))
}

/// Wallet origins listed under `webWallets`, invalid entries skipped
pub fn web_wallets(record: &Value) -> Vec<String> {
    let mut wallets: Vec<String> = Vec::new();
    let listed = record
        .get("webWallets")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for raw in listed.iter().filter_map(Value::as_str) {
        match normalize_origin(raw) {
            Some(origin) if !wallets.contains(&origin) => wallets.push(origin),
            Some(_) => {}
            None => debug!(wallet = raw, "skipping unusable wallet entry"),
        }
    }
    wallets
}

/// Reads JSON documents through a DWN gateway
#[async_trait]
pub trait DwebFetcher: Send + Sync {
    async fn fetch_json(&self, url: &Url) -> anyhow::Result<Value>;
}

pub async fn discover_wallets(
    fetcher: &dyn DwebFetcher,
    gateway: &str,
    did: &str,
) -> anyhow::Result<Vec<String>> {
    let url = connect_record_url(gateway, did)?;
    let record = fetcher.fetch_json(&url).await?;
    let wallets = web_wallets(&record);
    debug!(did, count = wallets.len(), "discovered wallets");
    Ok(wallets)
}
