//! Resilience Test Utilities
//!
//! This crate provides shared utilities for router resilience and
//! integration tests.
//!
//! ## Test Philosophy
//!
//! - **Exactly once**: Every call resolves once, whatever breaks
//! - **Ordering under reentrancy**: Deferred messages keep arrival order
//! - **Deterministic failures**: All faults are reproducible via FaultPlan
//! - **Observable**: Every dispatch and error lands in one shared event log

use ipc::{Message, MessagePayload};
use message_router::{
    CallError, DispatchError, MessageReceiver, Responder, Router, RouterConfig,
};
use sim_channel::SimWorld;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Once;

/// Installs a test-friendly tracing subscriber (once per test binary)
///
/// Output goes through the libtest capture, so it only shows for failing
/// tests.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Shared, ordered record of everything the routers under test did
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Returns a response handler that logs the call outcome under `label`
    pub fn call_outcome(&self, label: &str) -> impl FnOnce(Result<Message, CallError>) + 'static {
        let log = self.clone();
        let label = label.to_string();
        move |outcome| match outcome {
            Ok(response) => log.push(format!("{}: ok {}", label, response.request_id())),
            Err(error) => log.push(format!("{}: failed {}", label, error.request_id())),
        }
    }
}

/// What a [`RecordingReceiver`] does with the responder of an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    /// Answer at once with the call's name and payload
    Echo,
    /// Keep the responder for the test to use later
    Hold,
    /// Drop the responder unused
    Forget,
}

type CallHook = Box<dyn Fn(&Router, &Message)>;

/// Receiver that logs each dispatch as `"<label>: <name>"`
pub struct RecordingReceiver {
    label: String,
    log: EventLog,
    policy: Cell<ResponsePolicy>,
    held: RefCell<Vec<Responder>>,
    router: RefCell<Weak<Router>>,
    on_call: RefCell<Option<CallHook>>,
    rejected: RefCell<Vec<String>>,
}

impl RecordingReceiver {
    pub fn new(label: &str, log: &EventLog, policy: ResponsePolicy) -> Rc<Self> {
        Rc::new(Self {
            label: label.to_string(),
            log: log.clone(),
            policy: Cell::new(policy),
            held: RefCell::new(Vec::new()),
            router: RefCell::new(Weak::new()),
            on_call: RefCell::new(None),
            rejected: RefCell::new(Vec::new()),
        })
    }

    pub fn set_policy(&self, policy: ResponsePolicy) {
        self.policy.set(policy);
    }

    /// Runs `hook` against the owning router before each call is answered
    pub fn on_call(&self, hook: impl Fn(&Router, &Message) + 'static) {
        *self.on_call.borrow_mut() = Some(Box::new(hook));
    }

    /// Fails dispatch of any message called `name`, after logging it
    pub fn reject(&self, name: &str) {
        self.rejected.borrow_mut().push(name.to_string());
    }

    /// Takes the responders kept under [`ResponsePolicy::Hold`]
    pub fn take_held(&self) -> Vec<Responder> {
        self.held.borrow_mut().drain(..).collect()
    }

    fn attach(&self, router: &Rc<Router>) {
        *self.router.borrow_mut() = Rc::downgrade(router);
    }

    fn record(&self, message: &Message) -> Result<(), DispatchError> {
        self.log.push(format!("{}: {}", self.label, message.name()));
        if self.rejected.borrow().iter().any(|name| name == message.name()) {
            return Err(DispatchError::Rejected(message.name().to_string()));
        }
        Ok(())
    }
}

impl MessageReceiver for RecordingReceiver {
    fn accept(&self, message: Message) -> Result<(), DispatchError> {
        self.record(&message)
    }

    fn accept_with_responder(
        &self,
        message: Message,
        responder: Responder,
    ) -> Result<(), DispatchError> {
        self.record(&message)?;

        let router = self.router.borrow().upgrade();
        if let (Some(router), Some(hook)) = (router, self.on_call.borrow().as_ref()) {
            hook(&*router, &message);
        }

        match self.policy.get() {
            ResponsePolicy::Echo => {
                let (header, payload) = message.into_parts();
                responder
                    .respond(Message::response(header.name, payload))
                    .map_err(|error| DispatchError::Rejected(error.to_string()))
            }
            ResponsePolicy::Hold => {
                self.held.borrow_mut().push(responder);
                Ok(())
            }
            ResponsePolicy::Forget => Ok(()),
        }
    }
}

/// Two routers joined by one simulated pipe, sharing an event log
pub struct RouterPair {
    pub world: SimWorld,
    pub log: EventLog,
    pub client: Rc<Router>,
    pub server: Rc<Router>,
    pub client_receiver: Rc<RecordingReceiver>,
    pub server_receiver: Rc<RecordingReceiver>,
}

/// Connects a client and a server router in `world`
///
/// Both receivers echo calls and both connection error handlers log
/// `"<name>: connection error"`.
pub fn connected_pair(world: &SimWorld) -> RouterPair {
    connected_pair_with(
        world,
        RouterConfig::named("client"),
        RouterConfig::named("server"),
    )
}

/// Like [`connected_pair`], with explicit router configurations
pub fn connected_pair_with(
    world: &SimWorld,
    client_config: RouterConfig,
    server_config: RouterConfig,
) -> RouterPair {
    init_tracing();
    let log = EventLog::new();
    let (a, b) = world.pipe();

    let client = Rc::new(Router::new(a, client_config));
    let server = Rc::new(Router::new(b, server_config));
    let client_receiver = attach_receiver(&client, &log);
    let server_receiver = attach_receiver(&server, &log);

    RouterPair {
        world: world.clone(),
        log,
        client,
        server,
        client_receiver,
        server_receiver,
    }
}

fn attach_receiver(router: &Rc<Router>, log: &EventLog) -> Rc<RecordingReceiver> {
    let receiver = RecordingReceiver::new(router.name(), log, ResponsePolicy::Echo);
    receiver.attach(router);
    router.set_incoming_receiver(receiver.clone());

    let error_log = log.clone();
    let name = router.name().to_string();
    router.set_connection_error_handler(move || {
        error_log.push(format!("{}: connection error", name));
    });
    receiver
}

/// Builds a one-way message carrying `value`
pub fn note(name: &str, value: u64) -> Message {
    Message::one_way(name, payload(value))
}

/// Encodes `value` as a payload
pub fn payload(value: u64) -> MessagePayload {
    // A u64 always encodes.
    MessagePayload::new(&value).unwrap_or_default()
}
