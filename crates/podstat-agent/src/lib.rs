//! Podstat agent: configuration and operational HTTP endpoints

pub mod api;
pub mod config;
