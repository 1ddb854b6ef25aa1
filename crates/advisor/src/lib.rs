//! Soil-moisture irrigation advisor: turns probe telemetry into irrigation
//! recommendations and tracks irrigation runs through execution.

pub mod alerts;
pub mod config;
pub mod db;
pub mod error;
pub mod forecast;
pub mod ingest;
pub mod lifecycle;
pub mod locks;
pub mod model;
pub mod mqtt;
pub mod notify;
pub mod recommend;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod web;
