//! Service layer for the provider directory
//!
//! This module contains the application state, component wiring and
//! background task management for the running service.

pub mod app;
pub mod health;

pub use app::{AppState, ServiceError};
pub use health::{ComponentCheck, HealthCheck, HealthStatus};
