//! ImgGo manifest pipeline
//!
//! Asynchronous image-to-manifest jobs: the API queues a job, workers lease
//! it, run a vision model under the pattern's strict schema, record the
//! terminal state and notify subscribed webhooks. Stored manifests are
//! re-rendered on read as JSON, YAML, XML, CSV or plain text.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
