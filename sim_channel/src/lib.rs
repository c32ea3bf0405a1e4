//! # Simulated Channel
//!
//! This crate provides a simulated, in-process implementation of
//! [`ipc::Channel`].
//!
//! ## Purpose
//!
//! The simulated channel world allows testing routers without a transport:
//! - Runs under `cargo test`
//! - Deterministic (single thread, FIFO event and task queues, no clocks)
//! - Fast (no real I/O)
//! - Inspectable (pending events and tasks can be counted)
//!
//! ## Model
//!
//! A [`SimWorld`] owns every endpoint created by [`SimWorld::pipe`]. Sends
//! become delivery events on one global FIFO, so the world preserves send
//! order across all pipes. Disconnects are events on the same FIFO, so a peer
//! sees every message sent before the break. Posted tasks live on a separate
//! FIFO and only run from [`SimWorld::step`] / [`SimWorld::run_until_idle`],
//! never from inside a blocking [`Channel::wait_until`].

pub mod fault_injection;

use fault_injection::{FaultInjector, FaultPlan};
use ipc::{Channel, ChannelClient, ChannelError, ChannelId, Message};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

/// Simulated world configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Maximum events/tasks processed by one `run_until_idle` or one
    /// blocking wait (0 = unlimited)
    pub max_steps: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { max_steps: 100_000 }
    }
}

impl SimConfig {
    /// Sets the step limit
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Open,
    Broken,
    Closed,
}

struct Endpoint {
    id: ChannelId,
    peer: usize,
    state: EndpointState,
    /// The peer broke or closed and we have been told
    peer_gone: bool,
    /// The client has already seen (or raised) a connection error
    error_notified: bool,
    client: Option<Weak<dyn ChannelClient>>,
}

enum SimEvent {
    Deliver { to: usize, message: Message },
    ConnectionError { to: usize },
}

type Task = Box<dyn FnOnce()>;

struct WorldState {
    config: SimConfig,
    endpoints: Vec<Endpoint>,
    events: VecDeque<SimEvent>,
    tasks: VecDeque<Task>,
    faults: FaultInjector,
    delivered: usize,
}

/// Handle to a simulated channel world
///
/// Cloning the handle shares the world.
#[derive(Clone)]
pub struct SimWorld {
    state: Rc<RefCell<WorldState>>,
}

impl SimWorld {
    /// Creates a world with the default configuration
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    /// Creates a world with the given configuration
    pub fn with_config(config: SimConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(WorldState {
                config,
                endpoints: Vec::new(),
                events: VecDeque::new(),
                tasks: VecDeque::new(),
                faults: FaultInjector::default(),
                delivered: 0,
            })),
        }
    }

    /// Installs a fault plan for all pipes in this world
    pub fn with_fault_plan(self, plan: FaultPlan) -> Self {
        self.state.borrow_mut().faults = FaultInjector::new(plan);
        self
    }

    /// Creates a connected pair of endpoints
    pub fn pipe(&self) -> (SimChannel, SimChannel) {
        let mut state = self.state.borrow_mut();
        let a = state.endpoints.len();
        let b = a + 1;
        for peer in [b, a] {
            state.endpoints.push(Endpoint {
                id: ChannelId::new(),
                peer,
                state: EndpointState::Open,
                peer_gone: false,
                error_notified: false,
                client: None,
            });
        }
        let (id_a, id_b) = (state.endpoints[a].id, state.endpoints[b].id);
        drop(state);

        tracing::trace!(a = %id_a, b = %id_b, "created pipe");
        (self.endpoint(a, id_a), self.endpoint(b, id_b))
    }

    fn endpoint(&self, index: usize, id: ChannelId) -> SimChannel {
        SimChannel {
            world: self.clone(),
            index,
            id,
        }
    }

    /// Runs one event, or one posted task if no event is pending
    ///
    /// Returns false when the world is idle.
    pub fn step(&self) -> bool {
        if self.pump_event() {
            return true;
        }

        let task = self.state.borrow_mut().tasks.pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Steps until nothing is left to do, returning the number of steps taken
    pub fn run_until_idle(&self) -> usize {
        let max_steps = self.state.borrow().config.max_steps;
        let mut steps = 0;
        while self.step() {
            steps += 1;
            if max_steps != 0 && steps >= max_steps {
                tracing::warn!(steps, "step limit reached before the world went idle");
                break;
            }
        }
        steps
    }

    /// Returns the number of messages handed to clients so far
    pub fn delivered_count(&self) -> usize {
        self.state.borrow().delivered
    }

    /// Returns the number of undelivered events
    pub fn pending_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    /// Returns the number of posted tasks not yet run
    pub fn pending_tasks(&self) -> usize {
        self.state.borrow().tasks.len()
    }

    /// Processes one event, returning false if there was none
    fn pump_event(&self) -> bool {
        let event = self.state.borrow_mut().events.pop_front();
        match event {
            Some(SimEvent::Deliver { to, message }) => self.deliver(to, message),
            Some(SimEvent::ConnectionError { to }) => self.notify_connection_error(to),
            None => return false,
        }
        true
    }

    fn deliver(&self, to: usize, message: Message) {
        let (id, client, sever) = {
            let mut state = self.state.borrow_mut();
            let id = state.endpoints[to].id;
            if state.endpoints[to].state != EndpointState::Open {
                tracing::trace!(channel = %id, msg = %message, "dropping message for dead endpoint");
                return;
            }
            if state.faults.should_drop_message(&message) {
                tracing::debug!(channel = %id, msg = %message, "fault injection dropped message");
                return;
            }
            let Some(client) = state.endpoints[to].client.as_ref().and_then(Weak::upgrade) else {
                tracing::warn!(channel = %id, msg = %message, "no client bound, dropping message");
                return;
            };
            state.delivered += 1;
            (id, client, state.faults.record_delivery())
        };

        tracing::trace!(channel = %id, msg = %message, "delivering");
        if let Err(error) = client.on_message_received(message) {
            tracing::warn!(channel = %id, %error, "client rejected message, breaking channel");
            self.break_endpoint(to);
            self.notify_connection_error(to);
        }

        if sever {
            tracing::debug!(channel = %id, "fault injection severed pipe");
            let peer = self.state.borrow().endpoints[to].peer;
            self.break_endpoint(to);
            self.break_endpoint(peer);
        }
    }

    fn notify_connection_error(&self, to: usize) {
        let client = {
            let mut state = self.state.borrow_mut();
            let endpoint = &mut state.endpoints[to];
            endpoint.peer_gone = true;
            if endpoint.error_notified || endpoint.state == EndpointState::Closed {
                return;
            }
            endpoint.error_notified = true;
            endpoint.client.as_ref().and_then(Weak::upgrade)
        };

        if let Some(client) = client {
            client.on_connection_error();
        }
    }

    /// Marks an endpoint broken and queues the disconnect for its peer
    fn break_endpoint(&self, index: usize) {
        let mut state = self.state.borrow_mut();
        let endpoint = &mut state.endpoints[index];
        if endpoint.state != EndpointState::Open {
            return;
        }
        endpoint.state = EndpointState::Broken;
        let peer = endpoint.peer;
        state.events.push_back(SimEvent::ConnectionError { to: peer });
    }

    fn is_usable(&self, index: usize) -> bool {
        let state = self.state.borrow();
        let endpoint = &state.endpoints[index];
        endpoint.state == EndpointState::Open && !endpoint.peer_gone
    }

    fn send(&self, index: usize, message: Message) -> Result<(), ChannelError> {
        let mut state = self.state.borrow_mut();
        let endpoint = &state.endpoints[index];
        let peer = endpoint.peer;
        if endpoint.state != EndpointState::Open
            || endpoint.peer_gone
            || state.endpoints[peer].state != EndpointState::Open
        {
            return Err(ChannelError::Disconnected);
        }
        if state.faults.should_fail_send() {
            tracing::debug!(channel = %state.endpoints[index].id, msg = %message, "fault injection failed send");
            return Err(ChannelError::SendFailed("injected send failure".to_string()));
        }
        state
            .events
            .push_back(SimEvent::Deliver { to: peer, message });
        Ok(())
    }

    fn wait_until(&self, index: usize, condition: &dyn Fn() -> bool) -> Result<(), ChannelError> {
        let max_steps = self.state.borrow().config.max_steps;
        let mut steps = 0;
        loop {
            if condition() {
                return Ok(());
            }
            if !self.is_usable(index) {
                return Err(ChannelError::Disconnected);
            }
            if !self.pump_event() {
                return Err(ChannelError::Stalled);
            }
            steps += 1;
            if max_steps != 0 && steps >= max_steps {
                tracing::warn!(steps, "step limit reached inside blocking wait");
                return Err(ChannelError::Stalled);
            }
        }
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SimWorld")
            .field("endpoints", &state.endpoints.len())
            .field("pending_events", &state.events.len())
            .field("pending_tasks", &state.tasks.len())
            .field("delivered", &state.delivered)
            .finish()
    }
}

/// One end of a simulated pipe
///
/// Dropping the endpoint closes it.
pub struct SimChannel {
    world: SimWorld,
    index: usize,
    id: ChannelId,
}

impl SimChannel {
    /// Returns the world this endpoint lives in
    pub fn world(&self) -> &SimWorld {
        &self.world
    }
}

impl fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimChannel")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Channel for SimChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn bind(&self, client: Weak<dyn ChannelClient>) {
        self.world.state.borrow_mut().endpoints[self.index].client = Some(client);
    }

    fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.world.send(self.index, message)
    }

    fn wait_until(&self, condition: &dyn Fn() -> bool) -> Result<(), ChannelError> {
        self.world.wait_until(self.index, condition)
    }

    fn post_task(&self, task: Box<dyn FnOnce()>) {
        self.world.state.borrow_mut().tasks.push_back(task);
    }

    fn raise_error(&self) {
        self.world.state.borrow_mut().endpoints[self.index].error_notified = true;
        self.world.break_endpoint(self.index);
    }

    fn close(&self) {
        let mut state = self.world.state.borrow_mut();
        let endpoint = &mut state.endpoints[self.index];
        let was_open = endpoint.state == EndpointState::Open;
        endpoint.state = EndpointState::Closed;
        endpoint.client = None;
        let peer = endpoint.peer;
        if was_open {
            state.events.push_back(SimEvent::ConnectionError { to: peer });
        }
    }

    fn is_connected(&self) -> bool {
        self.world.is_usable(self.index)
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fault_injection::ChannelFault;
    use ipc::MessagePayload;
    use std::cell::Cell;

    #[derive(Default)]
    struct Recorder {
        received: RefCell<Vec<String>>,
        errors: Cell<usize>,
        reject: Cell<bool>,
    }

    impl ChannelClient for Recorder {
        fn on_message_received(&self, message: Message) -> Result<(), ChannelError> {
            if self.reject.get() {
                return Err(ChannelError::Rejected(message.name().to_string()));
            }
            self.received.borrow_mut().push(message.name().to_string());
            Ok(())
        }

        fn on_connection_error(&self) {
            self.errors.set(self.errors.get() + 1);
        }
    }

    fn bound_pipe(world: &SimWorld) -> (SimChannel, SimChannel, Rc<Recorder>, Rc<Recorder>) {
        let (a, b) = world.pipe();
        let ra = Rc::new(Recorder::default());
        let rb = Rc::new(Recorder::default());
        let weak_a: Weak<dyn ChannelClient> = Rc::<Recorder>::downgrade(&ra);
        let weak_b: Weak<dyn ChannelClient> = Rc::<Recorder>::downgrade(&rb);
        a.bind(weak_a);
        b.bind(weak_b);
        (a, b, ra, rb)
    }

    fn note(name: &str) -> Message {
        Message::one_way(name, MessagePayload::empty())
    }

    #[test]
    fn test_delivery_preserves_send_order() {
        let world = SimWorld::new();
        let (a, _b, _ra, rb) = bound_pipe(&world);

        a.send(note("one")).unwrap();
        a.send(note("two")).unwrap();
        a.send(note("three")).unwrap();
        assert_eq!(world.pending_events(), 3);

        assert_eq!(world.run_until_idle(), 3);
        assert_eq!(*rb.received.borrow(), vec!["one", "two", "three"]);
        assert_eq!(world.delivered_count(), 3);
    }

    #[test]
    fn test_posted_tasks_run_after_events() {
        let world = SimWorld::new();
        let (a, b, _ra, rb) = bound_pipe(&world);
        let order = Rc::new(RefCell::new(Vec::new()));

        let seen = order.clone();
        let recorder = rb.clone();
        b.post_task(Box::new(move || {
            seen.borrow_mut().push(recorder.received.borrow().len());
        }));
        a.send(note("first")).unwrap();

        world.run_until_idle();
        assert_eq!(*order.borrow(), vec![1]);
    }

    #[test]
    fn test_wait_until_does_not_run_tasks() {
        let world = SimWorld::new();
        let (a, b, _ra, rb) = bound_pipe(&world);
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        b.post_task(Box::new(move || flag.set(true)));
        a.send(note("ping")).unwrap();

        let recorder = rb.clone();
        b.wait_until(&|| !recorder.received.borrow().is_empty())
            .unwrap();
        assert!(!ran.get());
        assert_eq!(world.pending_tasks(), 1);
    }

    #[test]
    fn test_wait_until_stalls_without_traffic() {
        let world = SimWorld::new();
        let (a, _b, _ra, _rb) = bound_pipe(&world);

        assert_eq!(a.wait_until(&|| false), Err(ChannelError::Stalled));
    }

    #[test]
    fn test_close_notifies_peer_after_in_flight_messages() {
        let world = SimWorld::new();
        let (a, b, ra, rb) = bound_pipe(&world);

        a.send(note("last words")).unwrap();
        a.close();
        assert!(!a.is_connected());

        world.run_until_idle();
        assert_eq!(*rb.received.borrow(), vec!["last words"]);
        assert_eq!(rb.errors.get(), 1);
        assert_eq!(ra.errors.get(), 0);
        assert!(!b.is_connected());
        assert_eq!(b.send(note("late")), Err(ChannelError::Disconnected));
    }

    #[test]
    fn test_raise_error_only_notifies_peer() {
        let world = SimWorld::new();
        let (a, _b, ra, rb) = bound_pipe(&world);

        a.raise_error();
        world.run_until_idle();

        assert_eq!(ra.errors.get(), 0);
        assert_eq!(rb.errors.get(), 1);
    }

    #[test]
    fn test_rejected_message_breaks_both_ends() {
        let world = SimWorld::new();
        let (a, b, ra, rb) = bound_pipe(&world);
        rb.reject.set(true);

        a.send(note("bad")).unwrap();
        world.run_until_idle();

        assert_eq!(rb.errors.get(), 1);
        assert_eq!(ra.errors.get(), 1);
        assert!(!a.is_connected());
        assert!(!b.is_connected());
    }

    #[test]
    fn test_wait_returns_disconnected_when_peer_goes_away() {
        let world = SimWorld::new();
        let (a, b, ra, _rb) = bound_pipe(&world);

        b.close();
        assert_eq!(a.wait_until(&|| false), Err(ChannelError::Disconnected));
        assert_eq!(ra.errors.get(), 1);
    }

    #[test]
    fn test_fault_plan_fails_sends() {
        let world = SimWorld::new()
            .with_fault_plan(FaultPlan::new().with_fault(ChannelFault::FailNextSends { count: 1 }));
        let (a, _b, _ra, rb) = bound_pipe(&world);

        assert!(matches!(a.send(note("x")), Err(ChannelError::SendFailed(_))));
        a.send(note("y")).unwrap();
        world.run_until_idle();
        assert_eq!(*rb.received.borrow(), vec!["y"]);
    }

    #[test]
    fn test_fault_plan_disconnect_after() {
        let world = SimWorld::new()
            .with_fault_plan(FaultPlan::new().with_fault(ChannelFault::DisconnectAfter { messages: 1 }));
        let (a, _b, ra, rb) = bound_pipe(&world);

        a.send(note("first")).unwrap();
        a.send(note("second")).unwrap();
        world.run_until_idle();

        assert_eq!(*rb.received.borrow(), vec!["first"]);
        assert_eq!(ra.errors.get(), 1);
        assert_eq!(rb.errors.get(), 1);
    }

    #[test]
    fn test_step_limit() {
        let world = SimWorld::with_config(SimConfig::default().with_max_steps(2));
        let (a, _b, _ra, rb) = bound_pipe(&world);

        for name in ["a", "b", "c"] {
            a.send(note(name)).unwrap();
        }
        assert_eq!(world.run_until_idle(), 2);
        assert_eq!(rb.received.borrow().len(), 2);
    }
}
