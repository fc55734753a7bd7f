//! Admission control and dispatch core for a multi-tenant LLM gateway.
//!
//! Each inbound request is fingerprinted into a routing decision, dispatched to an
//! upstream channel and checked against distributed rate-limit policies before it
//! reaches the relay.

pub mod clock;
pub mod config;
pub mod dispatch;
mod env;
mod error;
pub mod fingerprint;
pub mod http;
pub mod limiter;
pub mod observability;
pub mod utils;

#[doc(hidden)]
pub mod test_support;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionConfig, ConfigError};
pub use env::{Env, parse_dotenv};
pub use error::{AdmissionError, Result, StoreError};
pub use fingerprint::{FingerprintCache, RelayMode, RequestView, RoutingDecision};
pub use http::{AdmissionState, RoutingContext};
pub use limiter::{DistributedRateLimiter, LimiterBackend, RateLimitPolicy};
pub use observability::{Observability, ObservabilitySnapshot};
