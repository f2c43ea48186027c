use serde::{Deserialize, Serialize};

/// DWN interfaces a permission scope can target
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DwnInterface {
    Protocols,
    Records,
}

/// Methods within an interface
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DwnMethod {
    Query,
    Read,
    Write,
    Delete,
    Subscribe,
}
