//! # Marketplace Sync
//!
//! Keeps an internal catalog, stock and order view consistent with external
//! marketplaces (Shopify, Dukaan, Amazon). Sync jobs pull and push through
//! marketplace adapters, webhooks feed incremental changes through an
//! ordering guard, and reconciliation detects and repairs drift.

pub mod adapters;
pub mod auth;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod event_ordering;
pub mod handlers;
pub mod inventory;
pub mod models;
pub mod orchestrator;
pub mod reconciliation;
pub mod repositories;
pub mod resilience;
pub mod scheduler;
pub mod schema_mapper;
pub mod server;
pub mod telemetry;
pub mod webhook_worker;
pub use migration;
