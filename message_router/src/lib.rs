//! # Message Router
//!
//! Request/response correlation and reentrancy-safe dispatch over a single
//! bidirectional [`ipc::Channel`].
//!
//! ## Philosophy
//!
//! - **Correlated**: Every call gets a fresh request id; every response
//!   resolves exactly one pending call
//! - **Exactly once**: Response handlers run once, with the response or with
//!   a failure when the connection dies first
//! - **Ordered**: Messages are dispatched in arrival order, even when some
//!   are deferred by a blocking call
//! - **Single-threaded**: A router lives on one execution context; nothing
//!   here is `Send`
//!
//! ## Example
//!
//! ```
//! use ipc::{Message, MessagePayload};
//! use message_router::{Router, RouterConfig};
//! use sim_channel::SimWorld;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let world = SimWorld::new();
//! let (a, b) = world.pipe();
//! let client = Router::new(a, RouterConfig::named("client"));
//! let _server = Router::new(b, RouterConfig::named("server"));
//!
//! let outcome = Rc::new(RefCell::new(None));
//! let slot = Rc::clone(&outcome);
//! client
//!     .send_and_register(Message::call("ping", MessagePayload::empty()), move |result| {
//!         *slot.borrow_mut() = Some(result.is_ok());
//!     })
//!     .unwrap();
//!
//! // The server has no receiver bound, so the call breaks the connection and
//! // the pending call fails.
//! world.run_until_idle();
//! assert_eq!(*outcome.borrow(), Some(false));
//! assert!(client.encountered_error());
//! ```

pub mod config;
pub mod error;
mod pending;
pub mod receiver;
pub mod reentrant;
pub mod responder;
pub mod router;
pub mod sync_call;

pub use config::RouterConfig;
pub use error::{CallError, DispatchError, RouterError};
pub use pending::ResponseHandler;
pub use receiver::MessageReceiver;
pub use reentrant::QueueError;
pub use responder::Responder;
pub use router::Router;
pub use sync_call::{sync_calls_allowed, SyncCallScope};
