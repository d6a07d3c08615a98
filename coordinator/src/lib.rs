pub mod aggregator;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod failover;
pub mod handlers;
pub mod model;
pub mod monitor;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod tracker;

pub use crate::config::Config;
pub use crate::coordinator::{Coordinator, CoordinatorSettings};
pub use crate::error::{CoordinatorError, Result};
pub use crate::handlers::build_router;
pub use crate::state::AppState;
