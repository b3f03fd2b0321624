//! Compose inference microservices into a single request-serving megaservice.
//!
//! A pipeline file names the services and the flows between them; the
//! orchestrator schedules each request over that graph concurrently,
//! reshaping payloads between neighbours, and the gateway projects the
//! terminal result onto an OpenAI-compatible HTTP surface.

pub mod cli;
pub mod client;
pub mod config;
pub mod gateway;
pub mod graph;
pub mod pipelines;
pub mod runtime;
pub mod server;
