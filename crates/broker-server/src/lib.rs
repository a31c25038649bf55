//! HTTP front end for the job broker.

pub mod app;
pub mod config;
pub mod metrics;
