// Inbound subscription bookkeeping.
//
// The client subscribes to the generic per-user queue and relies on the
// server to route messages for the connected identity there. A
// subscription belongs to one transport instance: it is established on
// every entry into `Connected` and invalidated on every exit.

use tracing::debug;

use supportchat_common::protocol::USER_QUEUE_DESTINATION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// STOMP subscription id, unique per registry.
    pub id: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    destination: String,
    active: Option<Subscription>,
    established: u64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(USER_QUEUE_DESTINATION)
    }
}

impl SubscriptionRegistry {
    pub fn new(destination: impl Into<String>) -> Self {
        Self { destination: destination.into(), active: None, established: 0 }
    }

    /// Create the subscription for a freshly connected transport,
    /// replacing any stale one.
    pub fn establish(&mut self) -> Subscription {
        let subscription = Subscription {
            id: format!("sub-{}", self.established),
            destination: self.destination.clone(),
        };
        self.established += 1;
        if let Some(stale) = self.active.replace(subscription.clone()) {
            debug!(stale = %stale.id, "replaced subscription that was never invalidated");
        }
        debug!(id = %subscription.id, destination = %subscription.destination, "subscription established");
        subscription
    }

    pub fn invalidate(&mut self) -> Option<Subscription> {
        let stale = self.active.take();
        if let Some(sub) = &stale {
            debug!(id = %sub.id, "subscription invalidated");
        }
        stale
    }

    pub fn active(&self) -> Option<&Subscription> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Subscriptions created over the registry's lifetime.
    pub fn established_count(&self) -> u64 {
        self.established
    }
}
