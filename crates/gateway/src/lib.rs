//! Gateway: session owner plus the HTTP/WebSocket surface around it.
//!
//! Lifecycle:
//! 1. Load config, resolve auth, pick the channel driver
//! 2. Build the [`SessionManager`] (state machine, pairing, reconnection)
//! 3. Start the health monitor and the upload janitor
//! 4. Serve REST routes and the `/ws` observer stream
//!
//! Channel protocol work lives behind `linkgate_channels::ChannelDriver`;
//! everything here is driver-agnostic.

pub mod auth;
pub mod broadcast;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod manager;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod uploads;
pub mod webhook;
pub mod ws;

pub use {
    broadcast::{BroadcastHub, GatewayEvent, Subscription},
    dispatcher::{DeliveryReceipt, DispatchPolicy},
    error::{GatewayError, Result},
    health::{HealthAction, HealthPolicy, spawn_health_monitor},
    manager::{HealthReport, KeywordMatch, ManagerOptions, SessionManager},
    scheduler::{ReconnectPolicy, ReconnectScheduler},
    server::{build_gateway_app, driver_factory, start_gateway},
    state::GatewayState,
    webhook::WebhookForwarder,
};
