//! Portcullis: a stateless API gateway.
//!
//! Every replica coordinates through a shared Redis cache (rate-limit
//! counters, circuit state, violation counters, token blacklist) and reads
//! durable configuration from PostgreSQL. A request flows through an ordered
//! pipeline (parse, log, IP rules, authenticate, rate limit, measure,
//! proxy, transform) and any stage may short-circuit with a terminal JSON
//! error.

pub mod audit;
pub mod auth;
pub mod autoblock;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ipguard;
pub mod metrics;
pub mod models;
pub mod proxy;
pub mod ratelimit;
pub mod routes;
pub mod routing;
pub mod store;
pub mod utils;

pub use config::Config;
pub use context::AppContext;
pub use error::{GatewayError, GatewayResult};
pub use routes::build_router;
