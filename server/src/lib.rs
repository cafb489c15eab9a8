//! EmpowerGRID verification engine
//!
//! Oracle-backed milestone verification and automated fund release.

pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod oracle;
pub mod routes;
pub mod services;
pub mod store;
