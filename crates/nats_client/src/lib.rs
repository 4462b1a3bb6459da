//! NATS wrapper used as the gateway's upstream publish/subscribe bus.

pub mod client;

pub use client::NatsClient;
