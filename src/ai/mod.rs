// AI domain — frame feeding, worker transport, and result correlation.

pub mod cache;
pub mod error;
pub mod feeder;
pub mod transport;
pub mod types;
pub mod wire;
