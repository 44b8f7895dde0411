pub mod payer;
pub mod pricing;
pub mod ratelimit;
pub mod reserve;

pub use payer::{
    budget_key_account, check_funding_agreement, record_covered_spend, resolve_payer,
    PayerDecision, PayerKind, SendPrincipal,
};
pub use pricing::{
    cost_from_usage, default_table, estimate_from_chars, estimate_from_tokens,
    pessimistic_max_cost, ModelPricing, PricingTable, TokenUsage,
};
pub use ratelimit::RateLimiter;
pub use reserve::{
    MemoryReservationStore, ReservationScope, ReservationStore, ReservationTicket,
};
