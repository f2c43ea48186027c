//! Pairing handshake engine.
//!
//! Three ways in: create a fresh DID, pair with a wallet popup found through
//! a DID's profile (or given directly), or pair through a wallet-connect
//! broker that shows a QR code and asks for a PIN.
//!
//! At most one session is active. Each session owns its cancellation token,
//! its PIN channel, its popup and its message route. Whatever way a session
//! ends, all four are released, and a session that is no longer active can
//! not change the published state.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::{ConnectOptions, WalletConnectBroker};
use crate::config::ConnectConfig;
use crate::discovery::{discover_wallets, parse_wallet_input, DwebFetcher, WalletTarget};
use crate::error::{PairingError, PinError};
use crate::pin::PinChannel;
use crate::registry::ProtocolRegistry;
use crate::transport::{normalize_origin, MessageRouter, PopupFeatures, PopupWindow, WindowHost, WindowMessage};
use crate::{permission_requests, ConnectMessage, DelegateDid, Permissions};

const CREATE_DID_FAILED: &str = "Error creating new DID";
const CONNECT_FAILED: &str = "Error connecting to wallet";

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn create_identity(&self) -> anyhow::Result<()>;
}

/// Stores the delegate DID and grants a wallet issued to this app
#[async_trait]
pub trait DelegateProcessor: Send + Sync {
    async fn process(&self, local_did: &str, delegate: &DelegateDid, grants: &[Value]) -> anyhow::Result<()>;
}

/// User-facing error reporting
pub trait Notifier: Send + Sync {
    fn error(&self, title: &str, error: &PairingError);
}

/// Reports errors to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn error(&self, title: &str, err: &PairingError) {
        error!(title, error = %error_chain(err), "pairing error");
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

pub struct Collaborators {
    pub identity: Arc<dyn IdentityService>,
    pub broker: Arc<dyn WalletConnectBroker>,
    pub delegate: Arc<dyn DelegateProcessor>,
    pub fetcher: Arc<dyn DwebFetcher>,
    pub windows: Arc<dyn WindowHost>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    CreatingIdentity,
    AwaitingPeerDiscovery { did: String },
    SelectingWallet { did: String, wallets: Vec<String> },
    /// Popup opening on a wallet given directly
    OpeningWallet { origin: String },
    AwaitingUri,
    UriReady { uri: String },
    AwaitingPin,
    /// PIN handed to the broker, waiting for the wallet's answer
    VerifyingPin,
    AwaitingAuthorization { origin: String },
    Succeeded,
    Cancelled,
    Failed { reason: String },
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Succeeded | PairingState::Cancelled | PairingState::Failed { .. }
        )
    }

    pub fn view(&self) -> ConnectView {
        match self {
            PairingState::Idle | PairingState::Cancelled => ConnectView::Init,
            PairingState::CreatingIdentity
            | PairingState::AwaitingPeerDiscovery { .. }
            | PairingState::OpeningWallet { .. }
            | PairingState::AwaitingUri
            | PairingState::VerifyingPin
            | PairingState::AwaitingAuthorization { .. } => ConnectView::Loading,
            PairingState::SelectingWallet { wallets, .. } => ConnectView::WalletList(wallets.clone()),
            PairingState::UriReady { uri } => ConnectView::AwaitingQr(uri.clone()),
            PairingState::AwaitingPin => ConnectView::AwaitingPin,
            PairingState::Succeeded => ConnectView::Done,
            PairingState::Failed { .. } => ConnectView::Failed,
        }
    }
}

/// What the UI should render
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectView {
    Init,
    Loading,
    WalletList(Vec<String>),
    AwaitingQr(String),
    AwaitingPin,
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingOutcome {
    Succeeded,
    /// Several wallets were found; finish with [`ConnectEngine::select_wallet`]
    SelectionRequired(Vec<String>),
    Cancelled,
    PopupClosed,
}

struct Session {
    id: u64,
    local_did: String,
    popup: Option<Arc<dyn PopupWindow>>,
    candidates: Vec<String>,
    /// Stops the popup watcher while the user picks a wallet
    selection: Option<CancellationToken>,
    pin: Arc<PinChannel>,
    cancel: CancellationToken,
}

impl Session {
    fn release(&self) {
        self.cancel.cancel();
        self.pin.cancel();
    }
}

#[derive(Clone)]
struct Ticket {
    id: u64,
    pin: Arc<PinChannel>,
    cancel: CancellationToken,
}

/// The single active-session slot and the published state
struct SessionBook {
    active: Mutex<Option<Session>>,
    state: watch::Sender<PairingState>,
    next_id: AtomicU64,
}

impl SessionBook {
    fn new() -> Self {
        let (state, _) = watch::channel(PairingState::Idle);
        Self {
            active: Mutex::new(None),
            state,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, id: u64, next: PairingState) {
        debug!(session = id, state = ?next, "pairing state");
        self.state.send_replace(next);
    }

    /// Start a session, tearing down any other one first
    fn begin(&self, local_did: String, initial: PairingState) -> Ticket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = Ticket {
            id,
            pin: Arc::new(PinChannel::new()),
            cancel: CancellationToken::new(),
        };
        let previous = {
            let mut active = self.lock();
            let previous = active.replace(Session {
                id,
                local_did,
                popup: None,
                candidates: Vec::new(),
                selection: None,
                pin: ticket.pin.clone(),
                cancel: ticket.cancel.clone(),
            });
            self.publish(id, initial);
            previous
        };
        if let Some(previous) = previous {
            info!(previous = previous.id, session = id, "superseding pairing session");
            previous.release();
            if let Some(popup) = previous.popup {
                popup.close();
            }
        }
        ticket
    }

    fn transition(&self, id: u64, next: PairingState) -> bool {
        let active = self.lock();
        match active.as_ref() {
            Some(session) if session.id == id => {
                self.publish(id, next);
                true
            }
            _ => false,
        }
    }

    /// Like [`SessionBook::transition`], but only out of `from`
    fn advance(&self, id: u64, from: &PairingState, next: PairingState) -> bool {
        let active = self.lock();
        let current = active.as_ref().is_some_and(|session| session.id == id) && *self.state.borrow() == *from;
        if current {
            self.publish(id, next);
        }
        current
    }

    fn with_session<R>(&self, id: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut active = self.lock();
        active.as_mut().filter(|session| session.id == id).map(f)
    }

    fn with_active<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.lock().as_mut().map(f)
    }

    /// End session `id` with `last` as the published state
    fn conclude(&self, id: u64, last: PairingState) -> Option<Session> {
        let mut active = self.lock();
        if active.as_ref().map(|session| session.id) != Some(id) {
            return None;
        }
        self.publish(id, last);
        let session = active.take();
        if let Some(session) = &session {
            session.release();
        }
        session
    }

    fn conclude_any(&self, last: PairingState) -> Option<Session> {
        let mut active = self.lock();
        let session = active.take()?;
        self.publish(session.id, last);
        session.release();
        Some(session)
    }
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Resolves once `popup` reports that the user closed it
async fn popup_closed(popup: &dyn PopupWindow, every: Duration) {
    let mut poll = tokio::time::interval(every);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        poll.tick().await;
        if popup.is_closed() {
            return;
        }
    }
}

async fn guarded<F: Future>(token: &CancellationToken, limit: Duration, work: F) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Interrupt::Cancelled),
        res = tokio::time::timeout(limit, work) => res.map_err(|_| Interrupt::TimedOut),
    }
}

enum HandshakeEvent {
    Cancelled,
    TimedOut,
    PopupClosed,
    Message(Option<ConnectMessage>),
}

pub struct ConnectEngine {
    config: ConnectConfig,
    registry: &'static ProtocolRegistry,
    deps: Collaborators,
    router: MessageRouter,
    book: Arc<SessionBook>,
}

impl ConnectEngine {
    pub fn new(config: ConnectConfig, deps: Collaborators) -> Self {
        Self {
            config,
            registry: ProtocolRegistry::builtin(),
            deps,
            router: MessageRouter::new(),
            book: Arc::new(SessionBook::new()),
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    pub fn state(&self) -> PairingState {
        self.book.state.borrow().clone()
    }

    pub fn view(&self) -> ConnectView {
        self.state().view()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.book.state.subscribe()
    }

    /// Feed an inbound window message. Returns true if the active session took it.
    pub fn deliver(&self, message: &WindowMessage) -> bool {
        self.router.dispatch(message)
    }

    /// Create a brand new DID instead of pairing with a wallet
    pub async fn initiate_create_identity(&self) -> Result<PairingOutcome, PairingError> {
        let ticket = self.book.begin(String::new(), PairingState::CreatingIdentity);
        info!(session = ticket.id, "creating new identity");

        let created = guarded(
            &ticket.cancel,
            self.config.session_timeout(),
            self.deps.identity.create_identity(),
        )
        .await;
        match created {
            Err(Interrupt::Cancelled) => Ok(PairingOutcome::Cancelled),
            Err(Interrupt::TimedOut) => {
                self.fail(ticket.id, CREATE_DID_FAILED, PairingError::Timeout("identity creation"))
                    .await
            }
            Ok(Err(e)) => {
                self.fail(ticket.id, CREATE_DID_FAILED, PairingError::IdentityCreationFailed(e))
                    .await
            }
            Ok(Ok(())) => Ok(self.succeed(ticket.id).await),
        }
    }

    /// Pair with a wallet.
    ///
    /// `Some(input)` takes a DID (wallets are looked up from its profile) or a
    /// wallet URL and runs the popup handshake. `None` goes through the
    /// wallet-connect broker and its QR code.
    pub async fn initiate_wallet_pairing(&self, selector: Option<&str>) -> Result<PairingOutcome, PairingError> {
        match selector {
            None => self.pair_with_broker().await,
            Some(input) => {
                let target = parse_wallet_input(input).ok_or(PairingError::InvalidInput)?;
                self.pair_with_popup(target).await
            }
        }
    }

    /// Continue a session that stopped at [`PairingOutcome::SelectionRequired`]
    pub async fn select_wallet(&self, wallet: &str) -> Result<PairingOutcome, PairingError> {
        let origin = normalize_origin(wallet).ok_or_else(|| PairingError::UnknownWallet(wallet.to_string()))?;
        let claimed = self
            .book
            .with_active(|session| {
                if !session.candidates.contains(&origin) {
                    return Err(PairingError::UnknownWallet(wallet.to_string()));
                }
                session.candidates.clear();
                if let Some(watcher) = session.selection.take() {
                    watcher.cancel();
                }
                let popup = session.popup.clone().ok_or(PairingError::NoActiveSession)?;
                let ticket = Ticket {
                    id: session.id,
                    pin: session.pin.clone(),
                    cancel: session.cancel.clone(),
                };
                Ok((ticket, session.local_did.clone(), popup))
            })
            .ok_or(PairingError::NoActiveSession)??;

        let (ticket, did, popup) = claimed;
        self.run_handshake(ticket, did, popup, origin).await
    }

    /// Hand a PIN typed by the user to the pending challenge
    pub fn submit_pin(&self, pin: &str) -> Result<(), PairingError> {
        if pin.trim().is_empty() {
            return Err(PairingError::EmptyPin);
        }
        let (id, channel) = self
            .book
            .with_active(|session| (session.id, session.pin.clone()))
            .ok_or(PairingError::NoActiveSession)?;
        if !channel.submit(pin) {
            return Err(PairingError::NoPendingPin);
        }
        self.book
            .advance(id, &PairingState::AwaitingPin, PairingState::VerifyingPin);
        Ok(())
    }

    /// Abort the active session. Returns false if nothing was running.
    pub fn cancel(&self) -> bool {
        match self.book.conclude_any(PairingState::Cancelled) {
            Some(session) => {
                info!(session = session.id, "pairing cancelled");
                if let Some(popup) = session.popup {
                    popup.close();
                }
                true
            }
            None => false,
        }
    }

    async fn pair_with_popup(&self, target: WalletTarget) -> Result<PairingOutcome, PairingError> {
        let (did, initial) = match &target {
            WalletTarget::Did(did) => (did.clone(), PairingState::AwaitingPeerDiscovery { did: did.clone() }),
            WalletTarget::Wallet(origin) => (String::new(), PairingState::OpeningWallet { origin: origin.clone() }),
        };
        let ticket = self.book.begin(did.clone(), initial);

        // open before any await so the window stays tied to the user gesture
        let features = PopupFeatures::centered(
            self.deps.windows.screen_size(),
            self.config.popup_width,
            self.config.popup_height,
        );
        let popup = match self.deps.windows.open_popup(&features) {
            Ok(popup) => popup,
            Err(e) => return self.fail(ticket.id, CONNECT_FAILED, PairingError::PopupBlocked(e)).await,
        };
        if self
            .book
            .with_session(ticket.id, |session| session.popup = Some(popup.clone()))
            .is_none()
        {
            popup.close();
            return Ok(PairingOutcome::Cancelled);
        }

        let origin = match target {
            WalletTarget::Wallet(origin) => origin,
            WalletTarget::Did(_) => {
                let discovered = tokio::select! {
                    biased;
                    res = guarded(
                        &ticket.cancel,
                        self.config.network_timeout(),
                        discover_wallets(self.deps.fetcher.as_ref(), &self.config.dweb_gateway, &did),
                    ) => Some(res),
                    _ = popup_closed(popup.as_ref(), self.config.popup_poll_interval()) => None,
                };
                let Some(discovered) = discovered else {
                    return Ok(self.closed_by_user(ticket.id));
                };
                if popup.is_closed() {
                    return Ok(self.closed_by_user(ticket.id));
                }
                let mut wallets = match discovered {
                    Err(Interrupt::Cancelled) => return Ok(PairingOutcome::Cancelled),
                    Err(Interrupt::TimedOut) => {
                        return self
                            .fail(ticket.id, CONNECT_FAILED, PairingError::Timeout("wallet discovery"))
                            .await
                    }
                    Ok(Err(e)) => return self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(e)).await,
                    Ok(Ok(wallets)) => wallets,
                };

                match wallets.len() {
                    0 => {
                        let err = anyhow::anyhow!("{did} has not published any web wallets");
                        return self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(err)).await;
                    }
                    1 => wallets.remove(0),
                    _ => {
                        let listed = wallets.clone();
                        let watcher = ticket.cancel.child_token();
                        let offered = self.book.with_session(ticket.id, |session| {
                            session.candidates = listed;
                            session.selection = Some(watcher.clone());
                        });
                        if offered.is_none()
                            || !self.book.transition(
                                ticket.id,
                                PairingState::SelectingWallet {
                                    did,
                                    wallets: wallets.clone(),
                                },
                            )
                        {
                            return Ok(PairingOutcome::Cancelled);
                        }
                        self.watch_selection(ticket.id, popup, watcher);
                        return Ok(PairingOutcome::SelectionRequired(wallets));
                    }
                }
            }
        };

        self.run_handshake(ticket, did, popup, origin).await
    }

    async fn run_handshake(
        &self,
        ticket: Ticket,
        did: String,
        popup: Arc<dyn PopupWindow>,
        origin: String,
    ) -> Result<PairingOutcome, PairingError> {
        // the route must exist before the wallet page can announce itself
        let mut subscription = self.router.subscribe(&origin);
        let connect_url = format!("{}/dweb-connect#origin={}", origin, self.config.origin());
        if let Err(e) = popup.navigate(&connect_url) {
            drop(subscription);
            return self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(e)).await;
        }
        if !self.book.transition(
            ticket.id,
            PairingState::AwaitingAuthorization { origin: origin.clone() },
        ) {
            return Ok(PairingOutcome::Cancelled);
        }
        info!(session = ticket.id, wallet = subscription.origin(), "waiting for wallet authorization");

        let request = ConnectMessage::AuthorizationRequest {
            did: did.clone(),
            permissions: permission_requests(self.registry, Permissions::all()),
        };
        let closed = popup_closed(popup.as_ref(), self.config.popup_poll_interval());
        let deadline = tokio::time::sleep(self.config.session_timeout());
        tokio::pin!(closed, deadline);

        loop {
            let event = tokio::select! {
                _ = ticket.cancel.cancelled() => HandshakeEvent::Cancelled,
                _ = &mut deadline => HandshakeEvent::TimedOut,
                _ = &mut closed => HandshakeEvent::PopupClosed,
                message = subscription.recv() => HandshakeEvent::Message(message),
            };

            match event {
                HandshakeEvent::Cancelled | HandshakeEvent::Message(None) => {
                    return Ok(PairingOutcome::Cancelled)
                }
                HandshakeEvent::TimedOut => {
                    drop(subscription);
                    return self
                        .fail(ticket.id, CONNECT_FAILED, PairingError::Timeout("wallet authorization"))
                        .await;
                }
                HandshakeEvent::PopupClosed => {
                    drop(subscription);
                    return Ok(self.closed_by_user(ticket.id));
                }
                HandshakeEvent::Message(Some(ConnectMessage::Loaded)) => {
                    debug!(session = ticket.id, "wallet page loaded, sending authorization request");
                    if let Err(e) = popup.post_message(&request, &origin) {
                        drop(subscription);
                        return self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(e)).await;
                    }
                }
                HandshakeEvent::Message(Some(ConnectMessage::AuthorizationResponse { grants, delegate_did })) => {
                    // only the first response counts
                    drop(subscription);
                    let (Some(grants), Some(delegate)) = (grants, delegate_did) else {
                        let err = anyhow::anyhow!("authorization response is missing grants or delegate DID");
                        return self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(err)).await;
                    };
                    return self.complete_delegation(&ticket, &did, delegate, grants).await;
                }
                HandshakeEvent::Message(Some(ConnectMessage::AuthorizationRequest { .. })) => {
                    debug!(session = ticket.id, "ignoring echoed authorization request");
                }
            }
        }
    }

    async fn pair_with_broker(&self) -> Result<PairingOutcome, PairingError> {
        let ticket = self.book.begin(String::new(), PairingState::AwaitingUri);
        info!(session = ticket.id, server = %self.config.connect_server_url, "starting wallet connect");

        let on_wallet_uri_ready = {
            let book = self.book.clone();
            let id = ticket.id;
            Box::new(move |uri: String| {
                book.transition(id, PairingState::UriReady { uri });
            })
        };
        let validate_pin = {
            let book = self.book.clone();
            let pin = ticket.pin.clone();
            let id = ticket.id;
            let limit = self.config.pin_timeout();
            Box::new(move || {
                let book = book.clone();
                let pin = pin.clone();
                Box::pin(async move {
                    let challenge = pin.open()?;
                    if !book.transition(id, PairingState::AwaitingPin) {
                        return Err(PinError::Cancelled);
                    }
                    pin.await_challenge(challenge, limit).await
                }) as futures_util::future::BoxFuture<'static, Result<String, PinError>>
            })
        };
        let options = ConnectOptions {
            connect_server_url: self.config.connect_server_url.clone(),
            wallet_uri: self.config.wallet_uri.clone(),
            permission_requests: permission_requests(self.registry, Permissions::all()),
            on_wallet_uri_ready,
            validate_pin,
        };

        let connected = guarded(
            &ticket.cancel,
            self.config.session_timeout(),
            self.deps.broker.connect(options),
        )
        .await;
        match connected {
            Err(Interrupt::Cancelled) => Ok(PairingOutcome::Cancelled),
            Err(Interrupt::TimedOut) => {
                self.fail(ticket.id, CONNECT_FAILED, PairingError::Timeout("wallet connect"))
                    .await
            }
            Ok(Err(e)) => self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(e)).await,
            Ok(Ok(result)) => {
                let did = result.connected_did;
                self.book
                    .with_session(ticket.id, |session| session.local_did = did.clone());
                self.complete_delegation(&ticket, &did, result.delegate_did, result.grants)
                    .await
            }
        }
    }

    async fn complete_delegation(
        &self,
        ticket: &Ticket,
        did: &str,
        delegate: DelegateDid,
        grants: Vec<Value>,
    ) -> Result<PairingOutcome, PairingError> {
        info!(session = ticket.id, delegate = %delegate.uri, grants = grants.len(), "processing delegate identity");
        let processed = guarded(
            &ticket.cancel,
            self.config.network_timeout(),
            self.deps.delegate.process(did, &delegate, &grants),
        )
        .await;
        match processed {
            Err(Interrupt::Cancelled) => Ok(PairingOutcome::Cancelled),
            Err(Interrupt::TimedOut) => {
                self.fail(ticket.id, CONNECT_FAILED, PairingError::Timeout("delegate processing"))
                    .await
            }
            Ok(Err(e)) => self.fail(ticket.id, CONNECT_FAILED, PairingError::PairingFailed(e)).await,
            Ok(Ok(())) => Ok(self.succeed(ticket.id).await),
        }
    }

    /// Watch the popup while the user picks a wallet. Closing it ends the
    /// session quietly; so does `stop` once a wallet is picked.
    fn watch_selection(&self, id: u64, popup: Arc<dyn PopupWindow>, stop: CancellationToken) {
        let book = self.book.clone();
        let notifier = self.deps.notifier.clone();
        let every = self.config.popup_poll_interval();
        let limit = self.config.session_timeout();
        let grace = self.config.error_close_grace();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {}
                _ = popup_closed(popup.as_ref(), every) => {
                    if book.conclude(id, PairingState::Idle).is_some() {
                        info!(session = id, "wallet popup closed during wallet selection");
                    }
                }
                _ = tokio::time::sleep(limit) => {
                    let err = PairingError::Timeout("wallet selection");
                    let failed = PairingState::Failed {
                        reason: err.to_string(),
                    };
                    if book.conclude(id, failed).is_some() {
                        notifier.error(CONNECT_FAILED, &err);
                        tokio::time::sleep(grace).await;
                        popup.close();
                    }
                }
            }
        });
    }

    async fn succeed(&self, id: u64) -> PairingOutcome {
        match self.book.conclude(id, PairingState::Succeeded) {
            Some(session) => {
                info!(session = id, "pairing succeeded");
                if let Some(popup) = session.popup {
                    tokio::time::sleep(self.config.done_close_delay()).await;
                    popup.close();
                }
                PairingOutcome::Succeeded
            }
            None => PairingOutcome::Cancelled,
        }
    }

    fn closed_by_user(&self, id: u64) -> PairingOutcome {
        match self.book.conclude(id, PairingState::Idle) {
            Some(_) => {
                info!(session = id, "wallet popup closed before authorization");
                PairingOutcome::PopupClosed
            }
            None => PairingOutcome::Cancelled,
        }
    }

    async fn fail(&self, id: u64, title: &str, error: PairingError) -> Result<PairingOutcome, PairingError> {
        let failed = PairingState::Failed {
            reason: error.to_string(),
        };
        let Some(session) = self.book.conclude(id, failed) else {
            return Ok(PairingOutcome::Cancelled);
        };
        self.deps.notifier.error(title, &error);
        if let Some(popup) = session.popup {
            tokio::time::sleep(self.config.error_close_grace()).await;
            popup.close();
        }
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectResult;
    use crate::registry::{PROFILE_PROTOCOL_URI, TASK_PROTOCOL_URI};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;
    use url::Url;

    const WALLET: &str = "https://wallet.example";
    const OTHER_WALLET: &str = "https://other-wallet.example";
    const DID: &str = "did:dht:alice";

    #[derive(Default)]
    struct MockPopup {
        navigated: Mutex<Vec<String>>,
        posted: Mutex<Vec<(ConnectMessage, String)>>,
        closed: AtomicBool,
        close_calls: AtomicUsize,
    }

    impl PopupWindow for MockPopup {
        fn navigate(&self, url: &str) -> anyhow::Result<()> {
            self.navigated.lock().unwrap().push(url.to_string());
            Ok(())
        }

        fn post_message(&self, message: &ConnectMessage, target_origin: &str) -> anyhow::Result<()> {
            self.posted
                .lock()
                .unwrap()
                .push((message.clone(), target_origin.to_string()));
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockWindows {
        blocked: bool,
        popups: Mutex<Vec<Arc<MockPopup>>>,
        /// engine state as seen when each popup was opened
        observer: Mutex<Option<watch::Receiver<PairingState>>>,
        states_at_open: Mutex<Vec<PairingState>>,
    }

    impl MockWindows {
        fn popup(&self, idx: usize) -> Arc<MockPopup> {
            self.popups.lock().unwrap()[idx].clone()
        }

        fn opened(&self) -> usize {
            self.popups.lock().unwrap().len()
        }
    }

    impl WindowHost for MockWindows {
        fn screen_size(&self) -> (u32, u32) {
            (1920, 1080)
        }

        fn open_popup(&self, features: &PopupFeatures) -> anyhow::Result<Arc<dyn PopupWindow>> {
            if self.blocked {
                anyhow::bail!("popup blocked");
            }
            assert_eq!(features.width, 500);
            if let Some(rx) = self.observer.lock().unwrap().as_ref() {
                self.states_at_open.lock().unwrap().push(rx.borrow().clone());
            }
            let popup = Arc::new(MockPopup::default());
            self.popups.lock().unwrap().push(popup.clone());
            Ok(popup)
        }
    }

    #[derive(Default)]
    struct MockIdentity {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityService for MockIdentity {
        async fn create_identity(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("agent vault locked");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockDelegate {
        calls: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl DelegateProcessor for MockDelegate {
        async fn process(&self, local_did: &str, delegate: &DelegateDid, grants: &[Value]) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((local_did.to_string(), delegate.uri.clone(), grants.len()));
            Ok(())
        }
    }

    struct MockFetcher {
        record: Value,
        /// held until notified
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl DwebFetcher for MockFetcher {
        async fn fetch_json(&self, _url: &Url) -> anyhow::Result<Value> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.record.clone())
        }
    }

    #[derive(Default)]
    struct MockBroker {
        fail: bool,
        ask_pin: bool,
        /// held after the URI is announced until notified
        gate: Option<Arc<Notify>>,
        pins: Mutex<Vec<Result<String, PinError>>>,
        requested: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl WalletConnectBroker for MockBroker {
        async fn connect(&self, options: ConnectOptions) -> anyhow::Result<ConnectResult> {
            self.requested
                .lock()
                .unwrap()
                .push(options.permission_requests.len());
            (options.on_wallet_uri_ready)("web5://connect?request_uri=x&encryption_key=y".into());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.ask_pin {
                let pin = (options.validate_pin)().await;
                self.pins.lock().unwrap().push(pin.clone());
                pin?;
            }
            if self.fail {
                anyhow::bail!("connect server unreachable");
            }
            Ok(ConnectResult {
                connected_did: DID.into(),
                delegate_did: DelegateDid {
                    uri: "did:jwk:delegate".into(),
                    material: Default::default(),
                },
                grants: vec![json!({ "grant": 1 }), json!({ "grant": 2 })],
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        titles: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn error(&self, title: &str, _error: &PairingError) {
            self.titles.lock().unwrap().push(title.to_string());
        }
    }

    struct Harness {
        engine: Arc<ConnectEngine>,
        windows: Arc<MockWindows>,
        identity: Arc<MockIdentity>,
        delegate: Arc<MockDelegate>,
        broker: Arc<MockBroker>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness_with(wallets: &[&str], identity: MockIdentity, broker: MockBroker, windows: MockWindows) -> Harness {
        build_harness(wallets, identity, broker, windows, None)
    }

    fn build_harness(
        wallets: &[&str],
        identity: MockIdentity,
        broker: MockBroker,
        windows: MockWindows,
        fetch_gate: Option<Arc<Notify>>,
    ) -> Harness {
        let windows = Arc::new(windows);
        let identity = Arc::new(identity);
        let delegate = Arc::new(MockDelegate::default());
        let broker = Arc::new(broker);
        let notifier = Arc::new(RecordingNotifier::default());
        let deps = Collaborators {
            identity: identity.clone(),
            broker: broker.clone(),
            delegate: delegate.clone(),
            fetcher: Arc::new(MockFetcher {
                record: json!({ "webWallets": wallets }),
                gate: fetch_gate,
            }),
            windows: windows.clone(),
            notifier: notifier.clone(),
        };
        Harness {
            engine: Arc::new(ConnectEngine::new(ConnectConfig::default(), deps)),
            windows,
            identity,
            delegate,
            broker,
            notifier,
        }
    }

    fn harness(wallets: &[&str]) -> Harness {
        harness_with(wallets, MockIdentity::default(), MockBroker::default(), MockWindows::default())
    }

    fn message(origin: &str, data: Value) -> WindowMessage {
        WindowMessage {
            origin: origin.to_string(),
            data,
        }
    }

    fn loaded(origin: &str) -> WindowMessage {
        message(origin, json!({ "type": "dweb-connect-loaded" }))
    }

    fn authorized(origin: &str) -> WindowMessage {
        message(
            origin,
            json!({
                "type": "dweb-connect-authorization-response",
                "grants": [{ "id": "g1" }],
                "delegateDid": { "uri": "did:jwk:delegate", "document": {} }
            }),
        )
    }

    async fn settle(cond: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    async fn wait_for_state(engine: &ConnectEngine, pred: impl Fn(&PairingState) -> bool) {
        let mut rx = engine.subscribe();
        rx.wait_for(|state| pred(state)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_identity_succeeds() {
        let h = harness(&[]);
        let outcome = h.engine.initiate_create_identity().await.unwrap();
        assert_eq!(outcome, PairingOutcome::Succeeded);
        assert_eq!(h.engine.view(), ConnectView::Done);
        assert_eq!(h.identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_identity_failure_is_reported() {
        let h = harness_with(
            &[],
            MockIdentity {
                fail: true,
                ..Default::default()
            },
            MockBroker::default(),
            MockWindows::default(),
        );
        let err = h.engine.initiate_create_identity().await.unwrap_err();
        assert!(matches!(err, PairingError::IdentityCreationFailed(_)));
        assert!(matches!(h.engine.state(), PairingState::Failed { .. }));
        assert_eq!(*h.notifier.titles.lock().unwrap(), vec![CREATE_DID_FAILED]);
    }

    #[tokio::test]
    async fn test_single_wallet_skips_selection_and_completes() {
        let h = harness(&[WALLET]);
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };

        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;
        assert_eq!(
            h.engine.state(),
            PairingState::AwaitingAuthorization { origin: WALLET.into() }
        );
        let popup = h.windows.popup(0);
        assert_eq!(
            *popup.navigated.lock().unwrap(),
            vec![format!("{WALLET}/dweb-connect#origin=http://localhost")]
        );

        assert!(h.engine.deliver(&loaded(WALLET)));
        settle(|| !popup.posted.lock().unwrap().is_empty()).await;
        {
            let posted = popup.posted.lock().unwrap();
            let (request, target) = &posted[0];
            assert_eq!(target, WALLET);
            match request {
                ConnectMessage::AuthorizationRequest { did, permissions } => {
                    assert_eq!(did, DID);
                    let uris: Vec<&str> = permissions
                        .iter()
                        .map(|p| p.protocol_definition.protocol.as_str())
                        .collect();
                    assert_eq!(uris, vec![PROFILE_PROTOCOL_URI, TASK_PROTOCOL_URI]);
                    assert!(permissions.iter().all(|p| p.permission_scopes.len() == 6));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert!(h.engine.deliver(&authorized(WALLET)));
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Succeeded);
        assert_eq!(
            *h.delegate.calls.lock().unwrap(),
            vec![(DID.to_string(), "did:jwk:delegate".to_string(), 1)]
        );
        assert_eq!(h.engine.view(), ConnectView::Done);
        assert!(popup.is_closed());
    }

    #[tokio::test]
    async fn test_foreign_origin_never_moves_the_handshake() {
        let h = harness(&[WALLET]);
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;
        let before = h.engine.state();

        assert!(!h.engine.deliver(&loaded("https://evil.example")));
        assert!(!h.engine.deliver(&authorized("https://evil.example")));
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.engine.state(), before);
        assert!(h.windows.popup(0).posted.lock().unwrap().is_empty());
        assert!(h.delegate.calls.lock().unwrap().is_empty());

        h.engine.cancel();
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_authorization_is_honoured_once() {
        let h = harness(&[WALLET]);
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;

        assert!(h.engine.deliver(&authorized(WALLET)));
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Succeeded);
        assert!(!h.engine.deliver(&authorized(WALLET)));
        assert_eq!(h.delegate.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_several_wallets_wait_for_selection() {
        let h = harness(&[WALLET, OTHER_WALLET]);
        let outcome = h.engine.initiate_wallet_pairing(Some(DID)).await.unwrap();
        assert_eq!(
            outcome,
            PairingOutcome::SelectionRequired(vec![WALLET.into(), OTHER_WALLET.into()])
        );
        assert_eq!(
            h.engine.view(),
            ConnectView::WalletList(vec![WALLET.into(), OTHER_WALLET.into()])
        );

        assert!(matches!(
            h.engine.select_wallet("https://evil.example").await,
            Err(PairingError::UnknownWallet(_))
        ));

        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.select_wallet(OTHER_WALLET).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;
        assert!(!h.engine.deliver(&authorized(WALLET)));
        assert!(h.engine.deliver(&authorized(OTHER_WALLET)));
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Succeeded);
        assert_eq!(h.windows.opened(), 1);
    }

    #[tokio::test]
    async fn test_wallet_url_input_skips_discovery() {
        let h = harness(&[]);
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some("https://wallet.example/")).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;
        assert!(h.engine.deliver(&loaded(WALLET)));
        let popup = h.windows.popup(0);
        settle(|| !popup.posted.lock().unwrap().is_empty()).await;
        assert!(matches!(
            &popup.posted.lock().unwrap()[0].0,
            ConnectMessage::AuthorizationRequest { did, .. } if did.is_empty()
        ));
        h.engine.cancel();
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_popup_tears_down_without_authorizing() {
        let h = harness(&[WALLET]);
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;

        h.windows.popup(0).closed.store(true, Ordering::SeqCst);
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::PopupClosed);
        assert_eq!(h.engine.state(), PairingState::Idle);
        assert!(!h.engine.deliver(&authorized(WALLET)));
        assert!(h.delegate.calls.lock().unwrap().is_empty());
        assert!(h.notifier.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_closes_popup_and_listener() {
        let h = harness(&[WALLET]);
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;

        assert!(h.engine.cancel());
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Cancelled);
        assert_eq!(h.engine.state(), PairingState::Cancelled);
        assert_eq!(h.windows.popup(0).close_calls.load(Ordering::SeqCst), 1);
        assert!(!h.engine.deliver(&loaded(WALLET)));
        assert!(!h.engine.cancel());
    }

    #[tokio::test]
    async fn test_qr_and_pin_round_trip() {
        let gate = Arc::new(Notify::new());
        let h = harness_with(
            &[],
            MockIdentity::default(),
            MockBroker {
                ask_pin: true,
                gate: Some(gate.clone()),
                ..Default::default()
            },
            MockWindows::default(),
        );
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(None).await })
        };

        wait_for_state(&h.engine, |s| matches!(s, PairingState::UriReady { .. })).await;
        assert_eq!(
            h.engine.view(),
            ConnectView::AwaitingQr("web5://connect?request_uri=x&encryption_key=y".into())
        );
        assert!(matches!(h.engine.submit_pin("1234"), Err(PairingError::NoPendingPin)));
        assert!(matches!(h.engine.state(), PairingState::UriReady { .. }));

        gate.notify_one();
        wait_for_state(&h.engine, |s| *s == PairingState::AwaitingPin).await;
        assert!(matches!(h.engine.submit_pin(""), Err(PairingError::EmptyPin)));
        h.engine.submit_pin("1234").unwrap();
        assert_eq!(h.engine.state(), PairingState::VerifyingPin);
        assert_eq!(h.engine.view(), ConnectView::Loading);
        assert!(matches!(h.engine.submit_pin("1234"), Err(PairingError::NoPendingPin)));
        assert_eq!(h.engine.state(), PairingState::VerifyingPin);

        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Succeeded);
        assert_eq!(*h.broker.pins.lock().unwrap(), vec![Ok("1234".to_string())]);
        assert_eq!(*h.broker.requested.lock().unwrap(), vec![2]);
        assert_eq!(
            *h.delegate.calls.lock().unwrap(),
            vec![(DID.to_string(), "did:jwk:delegate".to_string(), 2)]
        );
        assert_eq!(h.engine.view(), ConnectView::Done);
    }

    #[tokio::test]
    async fn test_cancel_rejects_pending_pin() {
        let h = harness_with(
            &[],
            MockIdentity::default(),
            MockBroker {
                ask_pin: true,
                ..Default::default()
            },
            MockWindows::default(),
        );
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(None).await })
        };
        wait_for_state(&h.engine, |s| *s == PairingState::AwaitingPin).await;

        assert!(h.engine.cancel());
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Cancelled);
        assert!(matches!(h.engine.submit_pin("1234"), Err(PairingError::NoActiveSession)));
        assert!(h.delegate.calls.lock().unwrap().is_empty());
        assert!(h.notifier.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_ends_in_failed_state() {
        let h = harness_with(
            &[],
            MockIdentity::default(),
            MockBroker {
                fail: true,
                ..Default::default()
            },
            MockWindows::default(),
        );
        let err = h.engine.initiate_wallet_pairing(None).await.unwrap_err();
        assert!(matches!(err, PairingError::PairingFailed(_)));
        assert_eq!(h.engine.view(), ConnectView::Failed);
        assert_eq!(*h.notifier.titles.lock().unwrap(), vec![CONNECT_FAILED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_timeout_fails_pairing() {
        let h = harness_with(
            &[],
            MockIdentity::default(),
            MockBroker {
                ask_pin: true,
                ..Default::default()
            },
            MockWindows::default(),
        );
        let err = h.engine.initiate_wallet_pairing(None).await.unwrap_err();
        assert!(matches!(err, PairingError::PairingFailed(_)));
        assert_eq!(*h.broker.pins.lock().unwrap(), vec![Err(PinError::TimedOut)]);
        assert!(matches!(h.engine.state(), PairingState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_invalid_input_opens_nothing() {
        let h = harness(&[WALLET]);
        let err = h.engine.initiate_wallet_pairing(Some("not a did")).await.unwrap_err();
        assert!(matches!(err, PairingError::InvalidInput));
        assert_eq!(h.windows.opened(), 0);
        assert_eq!(h.engine.state(), PairingState::Idle);
    }

    #[tokio::test]
    async fn test_blocked_popup_fails() {
        let h = harness_with(
            &[WALLET],
            MockIdentity::default(),
            MockBroker::default(),
            MockWindows {
                blocked: true,
                ..Default::default()
            },
        );
        let err = h.engine.initiate_wallet_pairing(Some(DID)).await.unwrap_err();
        assert!(matches!(err, PairingError::PopupBlocked(_)));
        assert_eq!(h.engine.view(), ConnectView::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_published_wallets_fails_and_closes_popup() {
        let h = harness(&[]);
        let err = h.engine.initiate_wallet_pairing(Some(DID)).await.unwrap_err();
        assert!(matches!(err, PairingError::PairingFailed(_)));
        assert!(h.windows.popup(0).is_closed());
        assert_eq!(*h.notifier.titles.lock().unwrap(), vec![CONNECT_FAILED]);
    }

    #[tokio::test]
    async fn test_new_session_supersedes_running_one() {
        let h = harness(&[WALLET]);
        let first = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;

        assert_eq!(
            h.engine.initiate_create_identity().await.unwrap(),
            PairingOutcome::Succeeded
        );
        assert_eq!(first.await.unwrap().unwrap(), PairingOutcome::Cancelled);
        assert!(h.windows.popup(0).is_closed());
        assert_eq!(h.engine.state(), PairingState::Succeeded);
    }

    #[tokio::test]
    async fn test_authorization_state_waits_for_the_route() {
        let h = harness(&[]);
        *h.windows.observer.lock().unwrap() = Some(h.engine.subscribe());
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(WALLET)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;

        assert_eq!(
            *h.windows.states_at_open.lock().unwrap(),
            vec![PairingState::OpeningWallet { origin: WALLET.into() }]
        );
        assert_eq!(PairingState::OpeningWallet { origin: WALLET.into() }.view(), ConnectView::Loading);
        assert!(h.engine.deliver(&loaded(WALLET)));
        h.engine.cancel();
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_popup_at_wallet_list_ends_session_quietly() {
        let h = harness(&[WALLET, OTHER_WALLET]);
        let outcome = h.engine.initiate_wallet_pairing(Some(DID)).await.unwrap();
        assert!(matches!(outcome, PairingOutcome::SelectionRequired(_)));

        h.windows.popup(0).closed.store(true, Ordering::SeqCst);
        wait_for_state(&h.engine, |s| *s == PairingState::Idle).await;

        assert!(matches!(
            h.engine.select_wallet(WALLET).await,
            Err(PairingError::NoActiveSession)
        ));
        assert!(h.notifier.titles.lock().unwrap().is_empty());
        assert!(!h.engine.deliver(&loaded(WALLET)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wallet_list_times_out() {
        let h = harness(&[WALLET, OTHER_WALLET]);
        h.engine.initiate_wallet_pairing(Some(DID)).await.unwrap();

        wait_for_state(&h.engine, |s| matches!(s, PairingState::Failed { .. })).await;
        assert_eq!(*h.notifier.titles.lock().unwrap(), vec![CONNECT_FAILED]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.windows.popup(0).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_picked_wallet_stops_list_watcher() {
        let h = harness(&[WALLET, OTHER_WALLET]);
        h.engine.initiate_wallet_pairing(Some(DID)).await.unwrap();
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.select_wallet(WALLET).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingAuthorization { .. })).await;

        h.windows.popup(0).closed.store(true, Ordering::SeqCst);
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::PopupClosed);
        assert_eq!(h.engine.state(), PairingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_popup_during_discovery_is_not_an_error() {
        let gate = Arc::new(Notify::new());
        let h = build_harness(
            &[],
            MockIdentity::default(),
            MockBroker::default(),
            MockWindows::default(),
            Some(gate.clone()),
        );
        let task = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.initiate_wallet_pairing(Some(DID)).await })
        };
        wait_for_state(&h.engine, |s| matches!(s, PairingState::AwaitingPeerDiscovery { .. })).await;

        h.windows.popup(0).closed.store(true, Ordering::SeqCst);
        assert_eq!(task.await.unwrap().unwrap(), PairingOutcome::PopupClosed);
        assert_eq!(h.engine.state(), PairingState::Idle);
        assert!(h.notifier.titles.lock().unwrap().is_empty());
    }
}
