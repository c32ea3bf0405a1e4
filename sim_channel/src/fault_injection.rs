//! Deterministic fault injection for testing
//!
//! This module lets tests inject faults into the simulated world's send
//! and delivery pipeline.
//!
//! ## Design Philosophy
//!
//! - **Deterministic**: Faults trigger on counts, never on randomness
//! - **Composable**: Multiple faults can be combined in one plan
//! - **Test-focused**: Not intended for production use
//!
//! ## Example
//!
//! ```
//! use sim_channel::fault_injection::{ChannelFault, FaultPlan};
//!
//! let plan = FaultPlan::new()
//!     .with_fault(ChannelFault::FailNextSends { count: 1 })
//!     .with_fault(ChannelFault::DisconnectAfter { messages: 3 });
//! assert_eq!(plan.faults().len(), 2);
//! ```

use ipc::Message;

/// A fault to inject into the channel world
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    /// Reject the next N sends with a transmit failure
    FailNextSends { count: usize },

    /// Lose the next N messages in transit
    DropNext { count: usize },

    /// Lose every message with the given name
    DropMatching { name: String },

    /// Break the pipe carrying the Nth delivered message, right after
    /// delivering it
    DisconnectAfter { messages: usize },
}

/// A plan describing all faults to inject
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    faults: Vec<ChannelFault>,
}

impl FaultPlan {
    /// Creates a new empty fault plan
    pub fn new() -> Self {
        Self { faults: Vec::new() }
    }

    /// Adds a fault to the plan
    pub fn with_fault(mut self, fault: ChannelFault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Returns the planned faults
    pub fn faults(&self) -> &[ChannelFault] {
        &self.faults
    }
}

/// Applies a [`FaultPlan`] to sends and deliveries
#[derive(Debug, Default)]
pub struct FaultInjector {
    plan: FaultPlan,
    fail_sends: usize,
    drop_next: usize,
    disconnect_after: Option<usize>,
    delivered: usize,
}

impl FaultInjector {
    /// Creates a new fault injector with the given plan
    pub fn new(plan: FaultPlan) -> Self {
        let mut injector = Self {
            plan: plan.clone(),
            ..Self::default()
        };

        for fault in plan.faults() {
            match fault {
                ChannelFault::FailNextSends { count } => injector.fail_sends += count,
                ChannelFault::DropNext { count } => injector.drop_next += count,
                ChannelFault::DisconnectAfter { messages } => {
                    injector.disconnect_after = Some(*messages);
                }
                // Handled per-message
                ChannelFault::DropMatching { .. } => {}
            }
        }

        injector
    }

    /// Checks whether the next send should fail
    pub fn should_fail_send(&mut self) -> bool {
        if self.fail_sends > 0 {
            self.fail_sends -= 1;
            return true;
        }
        false
    }

    /// Checks whether a message should be lost in transit
    pub fn should_drop_message(&mut self, message: &Message) -> bool {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return true;
        }

        self.plan.faults().iter().any(|fault| {
            matches!(fault, ChannelFault::DropMatching { name } if name == message.name())
        })
    }

    /// Records a delivery and reports whether the pipe should now break
    pub fn record_delivery(&mut self) -> bool {
        self.delivered += 1;
        self.disconnect_after == Some(self.delivered)
    }

    /// Returns the number of messages delivered so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipc::MessagePayload;

    fn message(name: &str) -> Message {
        Message::one_way(name, MessagePayload::empty())
    }

    #[test]
    fn test_fault_plan_creation() {
        let plan = FaultPlan::new();
        assert!(plan.faults().is_empty());
    }

    #[test]
    fn test_fail_next_sends() {
        let plan = FaultPlan::new().with_fault(ChannelFault::FailNextSends { count: 2 });
        let mut injector = FaultInjector::new(plan);

        assert!(injector.should_fail_send());
        assert!(injector.should_fail_send());
        assert!(!injector.should_fail_send());
    }

    #[test]
    fn test_drop_next() {
        let plan = FaultPlan::new().with_fault(ChannelFault::DropNext { count: 1 });
        let mut injector = FaultInjector::new(plan);

        assert!(injector.should_drop_message(&message("a")));
        assert!(!injector.should_drop_message(&message("a")));
    }

    #[test]
    fn test_drop_matching() {
        let plan = FaultPlan::new().with_fault(ChannelFault::DropMatching {
            name: "lost".to_string(),
        });
        let mut injector = FaultInjector::new(plan);

        assert!(injector.should_drop_message(&message("lost")));
        assert!(!injector.should_drop_message(&message("kept")));
        assert!(injector.should_drop_message(&message("lost")));
    }

    #[test]
    fn test_disconnect_after() {
        let plan = FaultPlan::new().with_fault(ChannelFault::DisconnectAfter { messages: 2 });
        let mut injector = FaultInjector::new(plan);

        assert!(!injector.record_delivery());
        assert!(injector.record_delivery());
        assert!(!injector.record_delivery());
        assert_eq!(injector.delivered(), 3);
    }
}
