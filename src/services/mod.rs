//! Background Services Module
//!
//! Long-running tasks around an estimator, driven by a [`ServiceManager`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  Reset Operator │────▶│    Estimator     │◀────│     Emitter     │
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//!         ▲                       ▲
//!         │ schedule              │ snapshots
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Schedule Pusher │     │     Merger       │   (aggregator only)
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! # Services
//!
//! - **ServiceManager**: Coordinates lifecycle of all background services
//! - **ResetOperator**: Resets an estimator on a pushed or fixed schedule
//! - **CardinalityMetricEmitter**: Publishes estimates as Prometheus metrics
//! - **DiscoveryService / SchedulePushService / MergeService**: Fleet aggregation
//!
//! # Example
//!
//! ```rust
//! use kuba_cardinality::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert_eq!(manager.status().len(), 0);
//! ```

pub mod aggregation;
pub mod emitter;
pub mod framework;
pub mod reset;

pub use aggregation::{
    AggregateViews, DiscoveryService, MergeReport, MergeService, PeerClient, SchedulePushService,
    ViewKind,
};
pub use emitter::{CardinalityMetricEmitter, EmitterConfig, Representation};
pub use framework::{Service, ServiceConfig, ServiceManager, ServiceStatus, SharedServiceManager};
pub use reset::{ResetOperator, ResetOperatorConfig};
