use std::sync::Mutex;

use async_trait::async_trait;
use dweb_connect::reconcile::{ConfiguredProtocol, InstalledProtocol, ProtocolStore};
use dweb_connect::*;
use tracing_subscriber::EnvFilter;

/// A local DWN that keeps configured protocols in memory
#[derive(Default)]
struct MemoryStore {
    installed: Mutex<Vec<InstalledProtocol>>,
}

struct Pushed {
    protocol: String,
}

#[async_trait]
impl ConfiguredProtocol for Pushed {
    async fn send(&self, target_did: &str) -> anyhow::Result<()> {
        println!("   ↗ {} → {}", self.protocol, target_did);
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for MemoryStore {
    async fn query_protocols(&self) -> anyhow::Result<Vec<InstalledProtocol>> {
        Ok(self.installed.lock().unwrap().clone())
    }

    async fn configure_protocol(
        &self,
        definition: &ProtocolDefinition,
    ) -> anyhow::Result<Box<dyn ConfiguredProtocol>> {
        let mut installed = self.installed.lock().unwrap();
        installed.retain(|p| p.protocol_uri() != Some(definition.protocol.as_str()));
        installed.push(InstalledProtocol {
            definition: definition.to_value(),
        });
        Ok(Box::new(Pushed {
            protocol: definition.protocol.clone(),
        }))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("🔁 dweb-connect - protocol reconcile");

    let store = MemoryStore::default();
    let registry = ProtocolRegistry::builtin();
    let did = "did:dht:demo";

    println!("\n1️⃣  First run against an empty store...");
    let report = Reconciler::new(registry).run(&store, did).await?;
    println!(
        "✅ installed {}, updated {}, unchanged {}",
        report.installed.len(),
        report.updated.len(),
        report.unchanged.len()
    );

    println!("\n2️⃣  Second run should change nothing...");
    let report = Reconciler::new(registry).run(&store, did).await?;
    println!("✅ configured {}, unchanged {}", report.configured(), report.unchanged.len());

    for entry in registry.all() {
        println!(
            "   {} fingerprint {:#018x}",
            entry.uri,
            definition_fingerprint(&entry.definition.to_value())
        );
    }

    Ok(())
}
