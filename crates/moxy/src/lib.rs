// Library exports for embedding and integration tests.

pub mod body;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod handlers;
pub mod hub;
pub mod lifecycle;
pub mod metrics;
pub mod rules;
pub mod server;
pub mod timing;
pub mod tls;
