use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use veil_core::types::{AccountId, ConversationId, LinkId};

use crate::event::ChatEvent;

/// Per-subscriber queue depth. A subscriber that falls this far behind the
/// live stream is treated as dead and pruned.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Who a subscriber claimed to be at connect time. The hub itself holds no
/// keys and makes no auth decision; the API layer verifies membership before
/// handing out a subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriberIdentity {
    Account(AccountId),
    Link(LinkId),
    Anonymous { display_name: String },
}

struct SubscriberEntry {
    identity: SubscriberIdentity,
    sender: mpsc::Sender<ChatEvent>,
}

/// Fan-out hub for one conversation. Pure multiplexer: no database handle,
/// no keys, no business logic. The subscriber table is only touched under
/// its own mutex, and dispatch holds that mutex just long enough to snapshot
/// the sender list.
pub struct ConversationHub {
    conversation_id: ConversationId,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
}

impl ConversationHub {
    fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Register a subscriber; returns its id and the event receiver.
    pub fn subscribe(&self, identity: SubscriberIdentity) -> (u64, mpsc::Receiver<ChatEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .insert(id, SubscriberEntry { identity, sender });
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber table poisoned")
            .len()
    }

    /// Fan an event out to every subscriber. Any write failure (closed or
    /// hopelessly backed-up queue) prunes that subscriber.
    pub fn publish(&self, event: ChatEvent) {
        let snapshot: Vec<(u64, mpsc::Sender<ChatEvent>)> = {
            let table = self.subscribers.lock().expect("subscriber table poisoned");
            table
                .iter()
                .map(|(id, entry)| (*id, entry.sender.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender) in snapshot {
            if sender.try_send(event.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut table = self.subscribers.lock().expect("subscriber table poisoned");
            for id in &dead {
                if let Some(entry) = table.remove(id) {
                    debug!(
                        conversation = %self.conversation_id,
                        identity = ?entry.identity,
                        "pruned dead subscriber"
                    );
                }
            }
        }
    }
}

/// Process-wide hub table: at most one hub instance per active conversation.
pub struct HubRegistry {
    hubs: Mutex<HashMap<ConversationId, Arc<ConversationHub>>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self {
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// Get-or-create the hub for a conversation.
    pub fn hub(&self, conversation_id: ConversationId) -> Arc<ConversationHub> {
        let mut hubs = self.hubs.lock().expect("hub table poisoned");
        Arc::clone(
            hubs.entry(conversation_id)
                .or_insert_with(|| Arc::new(ConversationHub::new(conversation_id))),
        )
    }

    /// Drop hubs with no subscribers (housekeeping; a deleted conversation's
    /// hub disappears once its last subscriber goes).
    pub fn prune_idle(&self) {
        let mut hubs = self.hubs.lock().expect("hub table poisoned");
        hubs.retain(|_, hub| hub.subscriber_count() > 0);
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}
