use std::sync::Arc;

use async_trait::async_trait;
use dweb_connect::broker::{ConnectOptions, ConnectResult, PairingUri, WalletConnectBroker};
use dweb_connect::discovery::DwebFetcher;
use dweb_connect::engine::{Collaborators, DelegateProcessor, IdentityService, LogNotifier};
use dweb_connect::transport::{PopupFeatures, PopupWindow, WindowHost};
use dweb_connect::*;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use url::Url;

struct FreshIdentity;

#[async_trait]
impl IdentityService for FreshIdentity {
    async fn create_identity(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct PrintDelegate;

#[async_trait]
impl DelegateProcessor for PrintDelegate {
    async fn process(&self, local_did: &str, delegate: &DelegateDid, grants: &[Value]) -> anyhow::Result<()> {
        println!("   🔑 {} now acts for {} with {} grants", delegate.uri, local_did, grants.len());
        Ok(())
    }
}

struct NoGateway;

#[async_trait]
impl DwebFetcher for NoGateway {
    async fn fetch_json(&self, url: &Url) -> anyhow::Result<Value> {
        anyhow::bail!("no gateway in this demo ({url})")
    }
}

struct NoWindows;

impl WindowHost for NoWindows {
    fn screen_size(&self) -> (u32, u32) {
        (1920, 1080)
    }

    fn open_popup(&self, _features: &PopupFeatures) -> anyhow::Result<Arc<dyn PopupWindow>> {
        anyhow::bail!("popups are not available in a terminal")
    }
}

/// Plays the wallet side: shows a QR URI, asks for a PIN, opens the sealed answer
struct LoopbackBroker;

#[async_trait]
impl WalletConnectBroker for LoopbackBroker {
    async fn connect(&self, options: ConnectOptions) -> anyhow::Result<ConnectResult> {
        let pairing = PairingUri::new(format!("{}/par/demo", options.connect_server_url));
        let sealed_request = pairing.seal_request(&options.permission_requests)?;
        println!("   📦 sealed request: {} bytes", sealed_request.ciphertext.len());
        (options.on_wallet_uri_ready)(pairing.render(&options.wallet_uri)?);

        let pin = (options.validate_pin)().await?;
        let sealed = pairing.seal_response(
            "4821",
            &json!({ "delegateDid": { "uri": "did:jwk:demo-delegate" }, "grants": [{ "id": "g1" }] }),
        )?;
        let answer = pairing.open_response(&pin, &sealed)?;
        Ok(ConnectResult {
            connected_did: "did:dht:demo".into(),
            delegate_did: serde_json::from_value(answer["delegateDid"].clone())?,
            grants: answer["grants"].as_array().cloned().unwrap_or_default(),
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("🔗 dweb-connect - wallet pairing over QR + PIN");

    let engine = Arc::new(ConnectEngine::new(
        ConnectConfig::default(),
        Collaborators {
            identity: Arc::new(FreshIdentity),
            broker: Arc::new(LoopbackBroker),
            delegate: Arc::new(PrintDelegate),
            fetcher: Arc::new(NoGateway),
            windows: Arc::new(NoWindows),
            notifier: Arc::new(LogNotifier),
        },
    ));

    // the user reads the PIN off the wallet and types it in
    let mut states = engine.subscribe();
    let typist = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let view = states.borrow_and_update().view();
                println!("   👁  {:?}", view);
                if view == ConnectView::AwaitingPin {
                    if let Err(e) = engine.submit_pin("4821") {
                        println!("   ❌ {e}");
                    }
                }
                if engine.state().is_terminal() {
                    break;
                }
            }
        })
    };

    println!("\n1️⃣  Pairing through the connect server...");
    let outcome = engine.initiate_wallet_pairing(None).await?;
    println!("✅ {:?}", outcome);
    typist.await?;

    println!("\n2️⃣  Popup pairing without a window host...");
    match engine.initiate_wallet_pairing(Some("did:dht:someone")).await {
        Ok(outcome) => println!("✅ {:?}", outcome),
        Err(e) => println!("❌ expected failure: {e}"),
    }

    Ok(())
}
