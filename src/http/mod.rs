//! HTTP server module
//!
//! This module handles HTTP request routing and handling:
//! - Axum router with the play server's wire surface
//! - Capability-descriptor query parsing shared across handlers
//! - HTTP headers (Content-Type, Content-Disposition, Cache-Control)
//! - CORS middleware

pub mod handlers;
pub mod routes;

pub use routes::create_router;
