//! veil-rpc
//!
//! JSON-RPC 2.0 surface (HTTP + WS) for the Veil core.
//!
//! Namespace: "veil"
//! Request/response methods cover accounts, conversations, membership,
//! links, rotation, user-only sends, wallets, shares, and the payment
//! webhook. Two subscriptions carry the live traffic:
//!   veil_subscribeStream       — per-send token stream (start/token/done/error)
//!   veil_subscribeConversation — per-conversation broadcast feed

pub mod api;
pub mod auth;
pub mod server;
pub mod types;

pub use auth::SessionRegistry;
pub use server::{RpcServer, RpcServerState};
