//! Cross-window plumbing between the app and a wallet popup.
//!
//! The host feeds every inbound window message into a [`MessageRouter`]. The
//! router keeps a single route: one origin, one subscriber. Messages from any
//! other origin are dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use url::{Origin, Url};

use crate::ConnectMessage;

/// A message as delivered by the host window
#[derive(Clone, Debug, PartialEq)]
pub struct WindowMessage {
    pub origin: String,
    pub data: Value,
}

/// Size and placement of the wallet popup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PopupFeatures {
    pub width: u32,
    pub height: u32,
    pub left: u32,
    pub top: u32,
}

impl PopupFeatures {
    pub fn centered(screen: (u32, u32), width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            left: screen.0.saturating_sub(width) / 2,
            top: screen.1.saturating_sub(height) / 2,
        }
    }

    /// `window.open` feature string
    pub fn to_feature_string(&self) -> String {
        format!(
            "popup=true,width={},height={},left={},top={}",
            self.width, self.height, self.left, self.top
        )
    }
}

/// Opens popup windows on behalf of the engine
pub trait WindowHost: Send + Sync {
    fn screen_size(&self) -> (u32, u32);

    fn open_popup(&self, features: &PopupFeatures) -> anyhow::Result<Arc<dyn PopupWindow>>;
}

pub trait PopupWindow: Send + Sync {
    fn navigate(&self, url: &str) -> anyhow::Result<()>;

    fn post_message(&self, message: &ConnectMessage, target_origin: &str) -> anyhow::Result<()>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Serialized origin of `raw`, or `None` for opaque or unparsable input
pub fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    match url.origin() {
        origin @ Origin::Tuple(..) => Some(origin.ascii_serialization()),
        Origin::Opaque(_) => None,
    }
}

struct Route {
    id: u64,
    origin: String,
    tx: mpsc::UnboundedSender<ConnectMessage>,
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    route: Option<Route>,
}

#[derive(Clone, Default)]
pub struct MessageRouter {
    state: Arc<Mutex<RouterState>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages from `origin` to the returned subscription.
    ///
    /// Any earlier subscription is closed: its `recv` yields `None`.
    pub fn subscribe(&self, origin: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        if let Some(previous) = state.route.replace(Route {
            id,
            origin: origin.to_string(),
            tx,
        }) {
            debug!(previous = %previous.origin, origin, "replacing message route");
        }
        Subscription {
            id,
            origin: origin.to_string(),
            router: self.clone(),
            rx,
        }
    }

    /// Deliver a host message. Returns true if it reached a subscriber.
    pub fn dispatch(&self, message: &WindowMessage) -> bool {
        let state = self.lock();
        let Some(route) = state.route.as_ref() else {
            return false;
        };
        if message.origin != route.origin {
            debug!(origin = %message.origin, expected = %route.origin, "ignoring message from foreign origin");
            return false;
        }
        match ConnectMessage::from_value(&message.data) {
            Some(parsed) => route.tx.send(parsed).is_ok(),
            None => {
                debug!(origin = %message.origin, "ignoring unrecognised message");
                false
            }
        }
    }

    pub fn is_routing(&self) -> bool {
        self.lock().route.is_some()
    }

    fn remove(&self, id: u64) {
        let mut state = self.lock();
        if state.route.as_ref().is_some_and(|route| route.id == id) {
            state.route = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Inbound messages from one origin; unsubscribes on drop
pub struct Subscription {
    id: u64,
    origin: String,
    router: MessageRouter,
    rx: mpsc::UnboundedReceiver<ConnectMessage>,
}

impl Subscription {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub async fn recv(&mut self) -> Option<ConnectMessage> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.remove(self.id);
    }
}
