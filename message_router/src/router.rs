//! The router: request/response correlation over one channel
//!
//! A [`Router`] sits between a [`Channel`] and a [`MessageReceiver`]. It
//! stamps request ids on outgoing calls, matches incoming responses to the
//! calls waiting for them, hands incoming calls to the receiver along with a
//! [`Responder`], and defers non-sync traffic that arrives while a
//! synchronous call blocks the owning frame.
//!
//! ## Reentrancy
//!
//! While a sync call waits, the channel keeps pumping. Sync-flagged messages
//! are handled on the spot so that nested sync calls between two routers can
//! complete. Everything else goes to the reentrant queue and is drained later
//! from a posted task, in arrival order.
//!
//! ## Connection errors
//!
//! A connection error is held back until the reentrant queue has drained, so
//! every message that arrived before the break is delivered before the error
//! handler runs. Teardown fails every outstanding call exactly once.

use crate::config::RouterConfig;
use crate::error::{CallError, RouterError};
use crate::pending::{PendingCallTable, Resolution, ResponseCallback, ResponseHandler};
use crate::receiver::MessageReceiver;
use crate::reentrant::ReentrantQueue;
use crate::responder::Responder;
use crate::sync_call;
use ipc::{Channel, ChannelClient, ChannelError, ChannelId, Message, RequestId};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Routes messages for one end of a channel
///
/// Dropping the router closes it: the channel end is closed, queued
/// messages are discarded, outstanding calls fail, and the connection error
/// handler is dropped without running.
pub struct Router {
    inner: Rc<RouterInner>,
}

impl Router {
    /// Binds a router to `channel`
    pub fn new(channel: impl Channel + 'static, config: RouterConfig) -> Self {
        let queue_capacity = config.reentrant_queue_capacity;
        let inner = Rc::new_cyclic(|weak_self| RouterInner {
            config,
            channel: Box::new(channel),
            weak_self: weak_self.clone(),
            receiver: RefCell::new(None),
            error_handler: RefCell::new(None),
            state: RefCell::new(RouterState::new(queue_capacity)),
        });

        let client: Weak<dyn ChannelClient> = Rc::downgrade(&inner) as Weak<dyn ChannelClient>;
        inner.channel.bind(client);
        tracing::debug!(router = inner.name(), channel = %inner.channel.id(), "router bound");

        Self { inner }
    }

    /// Sets the dispatch target for incoming calls and one-way messages
    pub fn set_incoming_receiver(&self, receiver: Rc<dyn MessageReceiver>) {
        *self.inner.receiver.borrow_mut() = Some(receiver);
    }

    /// Sets the handler run once when the connection fails
    ///
    /// The handler runs after every message received before the failure has
    /// been dispatched and after every outstanding call has been failed.
    pub fn set_connection_error_handler(&self, handler: impl FnOnce() + 'static) {
        *self.inner.error_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Sends a message that expects no response
    pub fn send_one_way(&self, message: Message) -> Result<(), RouterError> {
        self.inner.send_one_way(message)
    }

    /// Sends a call and registers `handler` for its outcome
    ///
    /// The handler runs exactly once: with the response, or with
    /// [`CallError::NoResponse`] if the connection fails or the router closes
    /// first. If this returns an error, nothing was registered and the handler
    /// never runs.
    ///
    /// For a sync call (`IS_SYNC` set) this blocks until the response arrives
    /// or the connection fails, and the handler has run by the time it
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if a sync call is issued without an open
    /// [`SyncCallScope`](crate::SyncCallScope) on this thread.
    pub fn send_and_register(
        &self,
        message: Message,
        handler: impl FnOnce(Result<Message, CallError>) + 'static,
    ) -> Result<(), RouterError> {
        self.inner.send_and_register(message, Box::new(handler))
    }

    /// Checks whether a connection error has been processed
    pub fn encountered_error(&self) -> bool {
        self.inner.state.borrow().encountered_error
    }

    /// Checks whether the router can still send and receive
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// Returns the number of calls awaiting a response
    pub fn pending_call_count(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    /// Returns the number of deferred messages not yet dispatched
    pub fn queued_message_count(&self) -> usize {
        self.inner.state.borrow().reentrant.len()
    }

    /// Returns the configured name
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Returns the id of the underlying channel end
    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel.id()
    }

    /// Breaks the connection as if a protocol error had been detected
    pub fn raise_error(&self) {
        self.inner.raise_error();
    }

    /// Closes the router without running the connection error handler
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Router")
            .field("name", &self.inner.config.name)
            .field("pending_calls", &state.pending.len())
            .field("queued_messages", &state.reentrant.len())
            .field("encountered_error", &state.encountered_error)
            .field("closed", &state.closed)
            .finish()
    }
}

struct RouterState {
    next_request_id: u64,
    pending: PendingCallTable,
    reentrant: ReentrantQueue,
    /// A drain task is posted and has not run yet
    drain_scheduled: bool,
    /// A drain is running somewhere up the stack
    draining: bool,
    /// Number of sync calls blocked in this router's frames
    sync_wait_depth: usize,
    /// A connection error was reported but teardown has not happened
    error_deferred: bool,
    error_task_posted: bool,
    encountered_error: bool,
    closed: bool,
}

impl RouterState {
    fn new(queue_capacity: usize) -> Self {
        Self {
            next_request_id: 1,
            pending: PendingCallTable::default(),
            reentrant: ReentrantQueue::with_capacity(queue_capacity),
            drain_scheduled: false,
            draining: false,
            sync_wait_depth: 0,
            error_deferred: false,
            error_task_posted: false,
            encountered_error: false,
            closed: false,
        }
    }

    /// Takes the next request id that is not 0 and not pending
    fn allocate_request_id(&mut self) -> RequestId {
        loop {
            let raw = self.next_request_id;
            self.next_request_id = raw.wrapping_add(1);
            let request_id = RequestId::new(raw);
            if !request_id.is_none() && !self.pending.contains(request_id) {
                return request_id;
            }
        }
    }

    fn check_can_send(&self) -> Result<(), RouterError> {
        if self.closed {
            return Err(RouterError::Closed);
        }
        if self.encountered_error {
            return Err(RouterError::ConnectionErrored);
        }
        Ok(())
    }
}

enum ErrorAction {
    Ignore,
    Defer,
    PostLater,
    TearDown,
}

/// Shared router state
///
/// Held by the [`Router`] handle; the channel, posted tasks and responders
/// only keep weak references.
pub(crate) struct RouterInner {
    config: RouterConfig,
    channel: Box<dyn Channel>,
    weak_self: Weak<RouterInner>,
    receiver: RefCell<Option<Rc<dyn MessageReceiver>>>,
    error_handler: RefCell<Option<Box<dyn FnOnce()>>>,
    state: RefCell<RouterState>,
}

impl RouterInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn is_valid(&self) -> bool {
        let state = self.state.borrow();
        !state.encountered_error && !state.closed
    }

    fn send_one_way(&self, message: Message) -> Result<(), RouterError> {
        if message.expects_response() || message.is_response() {
            return Err(RouterError::InvalidMessage(
                "one-way message carries call or response flags",
            ));
        }
        self.state.borrow().check_can_send()?;

        tracing::trace!(router = self.name(), msg = %message, "sending");
        self.channel.send(message)?;
        Ok(())
    }

    fn send_and_register(
        &self,
        mut message: Message,
        handler: ResponseHandler,
    ) -> Result<(), RouterError> {
        if !message.expects_response() || message.is_response() {
            return Err(RouterError::InvalidMessage("call does not expect a response"));
        }
        let sync = message.is_sync();
        if sync {
            sync_call::assert_sync_call_allowed(message.name());
        }

        let request_id = {
            let mut state = self.state.borrow_mut();
            state.check_can_send()?;
            state.allocate_request_id()
        };
        message.set_request_id(request_id);

        tracing::debug!(router = self.name(), msg = %message, "sending call");
        self.channel.send(message)?;

        if sync {
            self.wait_for_sync_response(request_id, handler);
        } else {
            self.state
                .borrow_mut()
                .pending
                .insert_async(request_id, ResponseCallback::new(request_id, handler));
        }
        Ok(())
    }

    /// Blocks in the channel until the sync call resolves, then runs `handler`
    fn wait_for_sync_response(&self, request_id: RequestId, handler: ResponseHandler) {
        let slot = {
            let mut state = self.state.borrow_mut();
            state.sync_wait_depth += 1;
            state.pending.insert_sync(request_id)
        };

        let waited = self.channel.wait_until(&|| slot.has_arrived());

        let response = {
            let mut state = self.state.borrow_mut();
            state.sync_wait_depth -= 1;
            state.pending.remove_sync(request_id);
            slot.take_response()
        };

        if response.is_none() && !slot.has_arrived() {
            // The wait gave up while the call was still outstanding. A late
            // response would match nothing, so the connection goes down now.
            tracing::warn!(
                router = self.name(),
                %request_id,
                result = ?waited,
                "sync wait ended without a response"
            );
            self.raise_error();
        }
        self.schedule_drain_if_needed();

        match response {
            Some(response) => {
                tracing::trace!(router = self.name(), %request_id, "sync call answered");
                handler(Ok(response));
            }
            None => {
                tracing::debug!(router = self.name(), %request_id, "sync call failed");
                handler(Err(CallError::NoResponse { request_id }));
            }
        }
    }

    pub(crate) fn send_response(&self, response: Message) -> Result<(), RouterError> {
        self.state.borrow().check_can_send()?;

        tracing::debug!(router = self.name(), msg = %response, "sending response");
        self.channel.send(response)?;
        Ok(())
    }

    /// Entry point for every message the channel delivers
    fn accept_incoming(&self, message: Message) -> Result<(), RouterError> {
        let defer = {
            let state = self.state.borrow();
            if state.closed {
                tracing::trace!(router = self.name(), msg = %message, "closed, dropping");
                return Ok(());
            }
            if !message.is_well_formed() {
                tracing::warn!(router = self.name(), msg = %message, "malformed message");
                return Err(RouterError::InvalidMessage(
                    "message is both a call and a response",
                ));
            }
            !message.is_sync()
                && (state.sync_wait_depth > 0 || state.draining || !state.reentrant.is_empty())
        };

        if defer {
            return self.enqueue_reentrant(message);
        }
        self.handle_message(message)
    }

    fn enqueue_reentrant(&self, message: Message) -> Result<(), RouterError> {
        {
            let mut state = self.state.borrow_mut();
            let name = message.name().to_string();
            if let Err(error) = state.reentrant.push(message) {
                tracing::warn!(router = self.name(), %error, "dropping overflow");
                return Err(error.into());
            }
            tracing::trace!(
                router = self.name(),
                name = %name,
                queued = state.reentrant.len(),
                "deferred message"
            );
        }
        self.schedule_drain_if_needed();
        Ok(())
    }

    /// Posts a drain task if messages are queued and nothing will drain them
    fn schedule_drain_if_needed(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.reentrant.is_empty()
                || state.drain_scheduled
                || state.draining
                || state.closed
            {
                return;
            }
            state.drain_scheduled = true;
        }

        let router = self.weak_self.clone();
        self.channel.post_task(Box::new(move || {
            if let Some(router) = router.upgrade() {
                router.drain_reentrant_queue();
            }
        }));
    }

    /// Dispatches queued messages in arrival order
    ///
    /// Stops at the first failure, discarding the rest and breaking the
    /// channel. A connection error deferred while messages were queued is
    /// processed once the drain finishes.
    fn drain_reentrant_queue(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.drain_scheduled = false;
            if state.closed || state.draining {
                return;
            }
            if state.sync_wait_depth > 0 {
                // The waiting frame reschedules once it resumes.
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                if state.closed {
                    None
                } else {
                    state.reentrant.pop_front()
                }
            };
            let Some(message) = next else {
                break;
            };

            if let Err(error) = self.handle_message(message) {
                let discarded = {
                    let mut state = self.state.borrow_mut();
                    state.error_deferred = true;
                    state.reentrant.clear()
                };
                tracing::warn!(
                    router = self.name(),
                    %error,
                    discarded,
                    "failed to dispatch queued message"
                );
                self.channel.raise_error();
                break;
            }
        }

        let run_deferred_error = {
            let mut state = self.state.borrow_mut();
            state.draining = false;
            state.error_deferred && !state.encountered_error && !state.closed
        };
        if run_deferred_error {
            self.handle_connection_error();
        }
    }

    fn handle_message(&self, message: Message) -> Result<(), RouterError> {
        if message.is_response() {
            let resolution = self.state.borrow_mut().pending.resolve(message);
            return match resolution {
                Resolution::Sync => Ok(()),
                Resolution::Async(callback, response) => {
                    tracing::trace!(router = self.name(), msg = %response, "matched response");
                    callback.complete(response);
                    Ok(())
                }
                Resolution::Unmatched(response) => {
                    self.unmatched_response(response);
                    Ok(())
                }
            };
        }

        let receiver = self.receiver()?;
        if message.expects_response() {
            let responder =
                Responder::new(self.weak_self.clone(), message.request_id(), message.is_sync());
            tracing::trace!(router = self.name(), msg = %message, "dispatching call");
            receiver.accept_with_responder(message, responder)?;
        } else {
            tracing::trace!(router = self.name(), msg = %message, "dispatching");
            receiver.accept(message)?;
        }
        Ok(())
    }

    fn receiver(&self) -> Result<Rc<dyn MessageReceiver>, RouterError> {
        self.receiver.borrow().clone().ok_or(RouterError::NoReceiver)
    }

    fn unmatched_response(&self, response: Message) {
        if self.config.strict_correlation {
            panic!(
                "router `{}` received {} matching no pending call",
                self.name(),
                response
            );
        }
        tracing::warn!(
            router = self.name(),
            msg = %response,
            "response matches no pending call, dropping"
        );
    }

    /// Reacts to the channel reporting a broken connection
    fn handle_connection_error(&self) {
        let action = {
            let mut state = self.state.borrow_mut();
            if state.encountered_error || state.closed {
                ErrorAction::Ignore
            } else {
                // Nothing more can arrive, so blocked callers may resume.
                state.pending.wake_sync_waiters();
                if state.draining || !state.reentrant.is_empty() {
                    state.error_deferred = true;
                    ErrorAction::Defer
                } else if state.sync_wait_depth > 0 {
                    state.error_deferred = true;
                    if state.error_task_posted {
                        ErrorAction::Ignore
                    } else {
                        state.error_task_posted = true;
                        ErrorAction::PostLater
                    }
                } else {
                    state.encountered_error = true;
                    state.error_deferred = false;
                    ErrorAction::TearDown
                }
            }
        };

        match action {
            ErrorAction::Ignore => {}
            ErrorAction::Defer => {
                tracing::debug!(
                    router = self.name(),
                    queued = self.state.borrow().reentrant.len(),
                    "connection error deferred until queued messages drain"
                );
            }
            ErrorAction::PostLater => {
                tracing::debug!(
                    router = self.name(),
                    "connection error deferred until sync calls unwind"
                );
                let router = self.weak_self.clone();
                self.channel.post_task(Box::new(move || {
                    if let Some(router) = router.upgrade() {
                        router.state.borrow_mut().error_task_posted = false;
                        router.handle_connection_error();
                    }
                }));
            }
            ErrorAction::TearDown => self.tear_down(),
        }
    }

    fn tear_down(&self) {
        let failed = self.state.borrow_mut().pending.take_async();
        tracing::warn!(
            router = self.name(),
            failed_calls = failed.len(),
            "connection error"
        );
        drop(failed);

        let handler = self.error_handler.borrow_mut().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn raise_error(&self) {
        if !self.is_valid() {
            return;
        }
        tracing::debug!(router = self.name(), "raising connection error");
        self.channel.raise_error();
        self.handle_connection_error();
    }

    pub(crate) fn close(&self) {
        let (failed, discarded) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.wake_sync_waiters();
            (state.pending.take_async(), state.reentrant.clear())
        };
        tracing::debug!(
            router = self.name(),
            failed_calls = failed.len(),
            discarded,
            "closing router"
        );

        self.channel.close();
        let handler = self.error_handler.borrow_mut().take();
        drop(handler);
        let receiver = self.receiver.borrow_mut().take();
        drop(receiver);
        drop(failed);
    }
}

impl ChannelClient for RouterInner {
    fn on_message_received(&self, message: Message) -> Result<(), ChannelError> {
        self.accept_incoming(message).map_err(|error| {
            tracing::warn!(router = self.name(), %error, "failed to handle incoming message");
            ChannelError::Rejected(error.to_string())
        })
    }

    fn on_connection_error(&self) {
        self.handle_connection_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::sync_call::SyncCallScope;
    use ipc::{MessageFlags, MessageHeader, MessagePayload};
    use sim_channel::fault_injection::{ChannelFault, FaultPlan};
    use sim_channel::SimWorld;
    use std::cell::Cell;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Policy {
        Echo,
        Hold,
        Forget,
    }

    struct TestReceiver {
        policy: Cell<Policy>,
        seen: RefCell<Vec<(String, RequestId)>>,
        held: RefCell<Vec<Responder>>,
    }

    impl TestReceiver {
        fn new(policy: Policy) -> Rc<Self> {
            Rc::new(Self {
                policy: Cell::new(policy),
                seen: RefCell::new(Vec::new()),
                held: RefCell::new(Vec::new()),
            })
        }

        fn names(&self) -> Vec<String> {
            self.seen.borrow().iter().map(|(name, _)| name.clone()).collect()
        }
    }

    impl MessageReceiver for TestReceiver {
        fn accept(&self, message: Message) -> Result<(), DispatchError> {
            self.seen
                .borrow_mut()
                .push((message.name().to_string(), message.request_id()));
            Ok(())
        }

        fn accept_with_responder(
            &self,
            message: Message,
            responder: Responder,
        ) -> Result<(), DispatchError> {
            self.seen
                .borrow_mut()
                .push((message.name().to_string(), message.request_id()));
            match self.policy.get() {
                Policy::Echo => {
                    let (header, payload) = message.into_parts();
                    responder
                        .respond(Message::response(header.name, payload))
                        .map_err(|error| DispatchError::Rejected(error.to_string()))
                }
                Policy::Hold => {
                    self.held.borrow_mut().push(responder);
                    Ok(())
                }
                Policy::Forget => Ok(()),
            }
        }
    }

    type Outcomes = Rc<RefCell<Vec<Result<Message, CallError>>>>;

    fn record(outcomes: &Outcomes) -> impl FnOnce(Result<Message, CallError>) + 'static {
        let outcomes = Rc::clone(outcomes);
        move |outcome| outcomes.borrow_mut().push(outcome)
    }

    fn pair(world: &SimWorld, server_policy: Policy) -> (Router, Router, Rc<TestReceiver>) {
        let (a, b) = world.pipe();
        let client = Router::new(a, RouterConfig::named("client"));
        let server = Router::new(b, RouterConfig::named("server"));
        let receiver = TestReceiver::new(server_policy);
        server.set_incoming_receiver(receiver.clone());
        (client, server, receiver)
    }

    fn payload(value: u64) -> MessagePayload {
        MessagePayload::new(&value).unwrap()
    }

    #[test]
    fn test_request_ids_start_at_one_and_increase() {
        let world = SimWorld::new();
        let (client, _server, receiver) = pair(&world, Policy::Echo);
        let outcomes: Outcomes = Rc::default();

        client
            .send_and_register(Message::call("first", payload(1)), record(&outcomes))
            .unwrap();
        client
            .send_and_register(Message::call("second", payload(2)), record(&outcomes))
            .unwrap();
        assert_eq!(client.pending_call_count(), 2);
        world.run_until_idle();

        let seen = receiver.seen.borrow();
        assert_eq!(seen[0].1, RequestId::new(1));
        assert_eq!(seen[1].1, RequestId::new(2));

        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 2);
        let first = outcomes[0].as_ref().unwrap();
        assert_eq!(first.request_id(), RequestId::new(1));
        assert!(first.is_response());
        assert_eq!(first.payload().deserialize::<u64>().unwrap(), 1);
        assert_eq!(client.pending_call_count(), 0);
    }

    #[test]
    fn test_responses_matched_in_any_order() {
        let world = SimWorld::new();
        let (client, _server, receiver) = pair(&world, Policy::Hold);
        let outcomes: Outcomes = Rc::default();

        for value in 1..=3 {
            client
                .send_and_register(Message::call("work", payload(value)), record(&outcomes))
                .unwrap();
        }
        world.run_until_idle();

        let held: Vec<Responder> = receiver.held.borrow_mut().drain(..).collect();
        for responder in held.into_iter().rev() {
            let value = responder.request_id().get() * 10;
            responder
                .respond(Message::response("work", payload(value)))
                .unwrap();
        }
        world.run_until_idle();

        let outcomes = outcomes.borrow();
        let matched: Vec<(u64, u64)> = outcomes
            .iter()
            .map(|outcome| {
                let response = outcome.as_ref().unwrap();
                (
                    response.request_id().get(),
                    response.payload().deserialize::<u64>().unwrap(),
                )
            })
            .collect();
        assert_eq!(matched, vec![(3, 30), (2, 20), (1, 10)]);
        assert!(client.is_valid());
    }

    #[test]
    fn test_one_way_reaches_receiver() {
        let world = SimWorld::new();
        let (client, _server, receiver) = pair(&world, Policy::Echo);

        client
            .send_one_way(Message::one_way("notify", MessagePayload::empty()))
            .unwrap();
        world.run_until_idle();

        assert_eq!(receiver.names(), vec!["notify"]);
        assert_eq!(receiver.seen.borrow()[0].1, RequestId::NONE);
    }

    #[test]
    fn test_flag_misuse_is_rejected() {
        let world = SimWorld::new();
        let (client, _server, _receiver) = pair(&world, Policy::Echo);

        assert!(matches!(
            client.send_one_way(Message::call("oops", MessagePayload::empty())),
            Err(RouterError::InvalidMessage(_))
        ));
        assert!(matches!(
            client.send_and_register(Message::one_way("oops", MessagePayload::empty()), |_| {}),
            Err(RouterError::InvalidMessage(_))
        ));
        assert_eq!(client.pending_call_count(), 0);
    }

    #[test]
    fn test_call_flagged_as_response_breaks_connection() {
        let world = SimWorld::new();
        let (peer, b) = world.pipe();
        let server = Router::new(b, RouterConfig::named("server"));
        let receiver = TestReceiver::new(Policy::Echo);
        server.set_incoming_receiver(receiver.clone());

        let mut both = Message::new(
            MessageHeader::new(
                "both",
                MessageFlags::EXPECTS_RESPONSE | MessageFlags::IS_RESPONSE,
            ),
            MessagePayload::empty(),
        );
        both.set_request_id(RequestId::new(1));
        peer.send(both).unwrap();
        world.run_until_idle();

        assert!(receiver.names().is_empty());
        assert_eq!(server.pending_call_count(), 0);
        assert!(server.encountered_error());
    }

    #[test]
    fn test_transmit_failure_registers_nothing() {
        let world = SimWorld::new()
            .with_fault_plan(FaultPlan::new().with_fault(ChannelFault::FailNextSends { count: 1 }));
        let (client, _server, _receiver) = pair(&world, Policy::Echo);
        let outcomes: Outcomes = Rc::default();

        let result = client.send_and_register(Message::call("ping", payload(1)), record(&outcomes));
        assert!(matches!(
            result,
            Err(RouterError::Transmit(ChannelError::SendFailed(_)))
        ));
        assert_eq!(client.pending_call_count(), 0);
        world.run_until_idle();
        assert!(outcomes.borrow().is_empty());

        client
            .send_and_register(Message::call("ping", payload(2)), record(&outcomes))
            .unwrap();
        world.run_until_idle();
        assert_eq!(outcomes.borrow().len(), 1);
    }

    #[test]
    fn test_sync_call_round_trip() {
        let world = SimWorld::new();
        let (client, _server, _receiver) = pair(&world, Policy::Echo);
        let outcomes: Outcomes = Rc::default();

        let _scope = SyncCallScope::allow();
        client
            .send_and_register(Message::sync_call("lookup", payload(7)), record(&outcomes))
            .unwrap();

        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 1);
        let response = outcomes[0].as_ref().unwrap();
        assert!(response.is_sync());
        assert_eq!(response.request_id(), RequestId::new(1));
        assert_eq!(client.pending_call_count(), 0);
    }

    #[test]
    #[should_panic(expected = "without an open SyncCallScope")]
    fn test_sync_call_without_scope_panics() {
        let world = SimWorld::new();
        let (client, _server, _receiver) = pair(&world, Policy::Echo);
        let _ = client.send_and_register(Message::sync_call("lookup", payload(7)), |_| {});
    }

    #[test]
    fn test_unmatched_response_dropped_when_lenient() {
        let world = SimWorld::new();
        let (a, b) = world.pipe();
        let router = Router::new(a, RouterConfig::named("lenient").with_strict_correlation(false));

        b.send(
            Message::response("stray", MessagePayload::empty())
                .into_response(RequestId::new(42), false),
        )
        .unwrap();
        world.run_until_idle();

        assert!(router.is_valid());
        assert_eq!(router.pending_call_count(), 0);
    }

    #[test]
    #[should_panic(expected = "matching no pending call")]
    fn test_unmatched_response_panics_when_strict() {
        let world = SimWorld::new();
        let (a, b) = world.pipe();
        let _router = Router::new(a, RouterConfig::named("strict").with_strict_correlation(true));

        b.send(
            Message::response("stray", MessagePayload::empty())
                .into_response(RequestId::new(42), false),
        )
        .unwrap();
        world.run_until_idle();
    }

    #[test]
    fn test_dropped_responder_raises_error_on_both_ends() {
        let world = SimWorld::new();
        let (client, server, _receiver) = pair(&world, Policy::Forget);
        let outcomes: Outcomes = Rc::default();
        let client_errors = Rc::new(Cell::new(0));
        let server_errors = Rc::new(Cell::new(0));
        {
            let client_errors = Rc::clone(&client_errors);
            client.set_connection_error_handler(move || client_errors.set(client_errors.get() + 1));
            let server_errors = Rc::clone(&server_errors);
            server.set_connection_error_handler(move || server_errors.set(server_errors.get() + 1));
        }

        client
            .send_and_register(Message::call("ignored", payload(1)), record(&outcomes))
            .unwrap();
        world.run_until_idle();

        assert!(server.encountered_error());
        assert!(client.encountered_error());
        assert_eq!(server_errors.get(), 1);
        assert_eq!(client_errors.get(), 1);
        assert_eq!(
            outcomes.borrow().as_slice(),
            &[Err(CallError::NoResponse {
                request_id: RequestId::new(1)
            })]
        );
        assert!(matches!(
            client.send_one_way(Message::one_way("late", MessagePayload::empty())),
            Err(RouterError::ConnectionErrored)
        ));
    }

    #[test]
    fn test_raise_error_is_idempotent() {
        let world = SimWorld::new();
        let (client, _server, _receiver) = pair(&world, Policy::Echo);
        let errors = Rc::new(Cell::new(0));
        {
            let errors = Rc::clone(&errors);
            client.set_connection_error_handler(move || errors.set(errors.get() + 1));
        }

        client.raise_error();
        client.raise_error();
        world.run_until_idle();

        assert_eq!(errors.get(), 1);
        assert!(!client.is_valid());
    }

    #[test]
    fn test_close_fails_calls_without_error_handler() {
        let world = SimWorld::new();
        let (client, server, receiver) = pair(&world, Policy::Hold);
        let outcomes: Outcomes = Rc::default();
        let errors = Rc::new(Cell::new(0));
        {
            let errors = Rc::clone(&errors);
            client.set_connection_error_handler(move || errors.set(errors.get() + 1));
        }

        client
            .send_and_register(Message::call("slow", payload(1)), record(&outcomes))
            .unwrap();
        world.run_until_idle();
        client.close();

        assert_eq!(outcomes.borrow().len(), 1);
        assert!(outcomes.borrow()[0].is_err());
        assert_eq!(errors.get(), 0);
        assert!(matches!(
            client.send_one_way(Message::one_way("late", MessagePayload::empty())),
            Err(RouterError::Closed)
        ));

        world.run_until_idle();
        assert!(server.encountered_error());
        let responder = receiver.held.borrow_mut().pop().unwrap();
        assert!(!responder.is_valid());
        assert_eq!(
            responder.respond(Message::response("slow", MessagePayload::empty())),
            Err(RouterError::ConnectionErrored)
        );
    }

    #[test]
    fn test_message_without_receiver_breaks_connection() {
        let world = SimWorld::new();
        let (a, b) = world.pipe();
        let client = Router::new(a, RouterConfig::named("client"));
        let server = Router::new(b, RouterConfig::named("server"));

        client
            .send_one_way(Message::one_way("hello", MessagePayload::empty()))
            .unwrap();
        world.run_until_idle();

        assert!(server.encountered_error());
        assert!(client.encountered_error());
    }
}
