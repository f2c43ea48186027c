use serde::{Deserialize, Serialize};
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

pub mod broker;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod interface;
pub mod pin;
pub mod reconcile;
pub mod registry;
pub mod transport;

pub use canonical::canonicalize;
pub use config::ConnectConfig;
pub use engine::{ConnectEngine, ConnectView, PairingOutcome, PairingState};
pub use error::{PairingError, PinError, ReconcileError};
pub use interface::{DwnInterface, DwnMethod};
pub use reconcile::{reconcile, Reconciler};
pub use registry::{ProtocolDefinition, ProtocolRegistry};

bitflags::bitflags! {
    /// Record capabilities an app asks a wallet to delegate
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DELETE = 1 << 2;
        const QUERY = 1 << 3;
        const SUBSCRIBE = 1 << 4;
    }
}

impl Permissions {
    fn record_methods(self) -> impl Iterator<Item = DwnMethod> {
        [
            (Permissions::READ, DwnMethod::Read),
            (Permissions::WRITE, DwnMethod::Write),
            (Permissions::DELETE, DwnMethod::Delete),
            (Permissions::QUERY, DwnMethod::Query),
            (Permissions::SUBSCRIBE, DwnMethod::Subscribe),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, method)| method)
    }
}

/// One interface/method pair scoped to a protocol
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PermissionScope {
    pub interface: DwnInterface,
    pub method: DwnMethod,
    pub protocol: String,
}

/// Permissions requested for a single protocol
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub protocol_definition: ProtocolDefinition,
    pub permission_scopes: Vec<PermissionScope>,
}

impl PermissionRequest {
    /// Protocol query access is always included so the app can find its protocol
    pub fn for_protocol(definition: &ProtocolDefinition, permissions: Permissions) -> Self {
        let uri = definition.protocol.clone();
        let mut scopes = vec![PermissionScope {
            interface: DwnInterface::Protocols,
            method: DwnMethod::Query,
            protocol: uri.clone(),
        }];
        scopes.extend(permissions.record_methods().map(|method| PermissionScope {
            interface: DwnInterface::Records,
            method,
            protocol: uri.clone(),
        }));
        Self {
            protocol_definition: definition.clone(),
            permission_scopes: scopes,
        }
    }
}

/// Requests for every registered protocol, in registry order
pub fn permission_requests(registry: &ProtocolRegistry, permissions: Permissions) -> Vec<PermissionRequest> {
    registry
        .definitions()
        .map(|definition| PermissionRequest::for_protocol(definition, permissions))
        .collect()
}

/// Portable delegate DID handed over by the wallet
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DelegateDid {
    pub uri: String,
    #[serde(flatten)]
    pub material: serde_json::Map<String, Value>,
}

/// Messages exchanged with a wallet popup
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ConnectMessage {
    #[serde(rename = "dweb-connect-loaded")]
    Loaded,
    #[serde(rename = "dweb-connect-authorization-request")]
    AuthorizationRequest {
        did: String,
        permissions: Vec<PermissionRequest>,
    },
    #[serde(rename = "dweb-connect-authorization-response")]
    AuthorizationResponse {
        #[serde(default)]
        grants: Option<Vec<Value>>,
        #[serde(rename = "delegateDid", default)]
        delegate_did: Option<DelegateDid>,
    },
}

impl ConnectMessage {
    /// Parse raw message data; anything unrecognised yields `None`
    pub fn from_value(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Fingerprint of a definition's canonical form, for logs and reports
pub fn definition_fingerprint(definition: &Value) -> u64 {
    xxh3_64(canonicalize(definition).as_bytes())
}
