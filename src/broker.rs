//! Wallet-connect broker seam.
//!
//! The broker runs the QR based pairing against a connect server. The engine
//! only supplies callbacks and treats the QR payload as an opaque string.
//!
//! [`PairingUri`] is a reference helper for broker implementations, not used
//! by the engine: it builds and reads `web5://connect` pairing URIs and seals
//! the request and the PIN-bound response (see `src/examples/pairing_demo.rs`).

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::crypto::{generate_key, SealedPayload, KEY_LEN};
use crate::error::PinError;
use crate::{DelegateDid, PermissionRequest};

pub type UriReadyCallback = Box<dyn Fn(String) + Send + Sync>;
pub type PinValidator = Box<dyn Fn() -> BoxFuture<'static, Result<String, PinError>> + Send + Sync>;

pub struct ConnectOptions {
    pub connect_server_url: String,
    pub wallet_uri: String,
    pub permission_requests: Vec<PermissionRequest>,
    /// Called once the pairing URI can be shown as a QR code
    pub on_wallet_uri_ready: UriReadyCallback,
    /// Called when the wallet shows a PIN the user must type back
    pub validate_pin: PinValidator,
}

/// What a wallet hands back after approving the request
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectResult {
    pub connected_did: String,
    pub delegate_did: DelegateDid,
    pub grants: Vec<Value>,
}

#[async_trait]
pub trait WalletConnectBroker: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> anyhow::Result<ConnectResult>;
}

/// Where the sealed request lives and the key that opens it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    pub request_uri: String,
    pub encryption_key: [u8; KEY_LEN],
}

impl PairingUri {
    pub fn new(request_uri: impl Into<String>) -> Self {
        Self {
            request_uri: request_uri.into(),
            encryption_key: generate_key(),
        }
    }

    /// `<wallet_uri>?request_uri=..&encryption_key=..`
    pub fn render(&self, wallet_uri: &str) -> anyhow::Result<String> {
        let mut url = Url::parse(wallet_uri)?;
        url.query_pairs_mut()
            .append_pair("request_uri", &self.request_uri)
            .append_pair("encryption_key", &URL_SAFE_NO_PAD.encode(self.encryption_key));
        Ok(url.into())
    }

    pub fn parse(uri: &str) -> anyhow::Result<Self> {
        let url = Url::parse(uri)?;
        let mut request_uri = None;
        let mut encoded_key = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "request_uri" => request_uri = Some(value.into_owned()),
                "encryption_key" => encoded_key = Some(value.into_owned()),
                _ => {}
            }
        }
        let request_uri = request_uri.ok_or_else(|| anyhow::anyhow!("Pairing URI has no request_uri"))?;
        let encoded_key = encoded_key.ok_or_else(|| anyhow::anyhow!("Pairing URI has no encryption_key"))?;
        let encryption_key: [u8; KEY_LEN] = URL_SAFE_NO_PAD
            .decode(encoded_key)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Encryption key must be {} bytes", KEY_LEN))?;
        Ok(Self {
            request_uri,
            encryption_key,
        })
    }

    /// Seal a request for the wallet to fetch from `request_uri`
    pub fn seal_request<T: Serialize>(&self, request: &T) -> anyhow::Result<SealedPayload> {
        SealedPayload::seal(&self.encryption_key, &serde_json::to_vec(request)?, b"")
    }

    pub fn open_request(&self, sealed: &SealedPayload) -> anyhow::Result<Value> {
        Ok(serde_json::from_slice(&sealed.open(&self.encryption_key, b"")?)?)
    }

    /// Seal the wallet's answer bound to the PIN the user is shown
    pub fn seal_response<T: Serialize>(&self, pin: &str, response: &T) -> anyhow::Result<SealedPayload> {
        SealedPayload::seal(&self.encryption_key, &serde_json::to_vec(response)?, pin.as_bytes())
    }

    /// Open the wallet's answer; a wrong PIN fails authentication
    pub fn open_response(&self, pin: &str, sealed: &SealedPayload) -> anyhow::Result<Value> {
        Ok(serde_json::from_slice(&sealed.open(&self.encryption_key, pin.as_bytes())?)?)
    }
}
