// Orchestration domain — session lifecycle, timers, and ingestion dispatch.

pub mod fsm;
pub mod ingester;
pub mod session;
pub mod store_client;
pub mod timers;
