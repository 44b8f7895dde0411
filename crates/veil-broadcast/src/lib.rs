pub mod event;
pub mod hub;

pub use event::ChatEvent;
pub use hub::{ConversationHub, HubRegistry, SubscriberIdentity};
