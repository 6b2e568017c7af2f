//! Brokerage layer: discovery-mode resolution, filesystem rendezvous, the
//! client-side `find_workers` query, and the server-side `set_availability`
//! announcer.

pub mod client;
pub mod config;
pub mod rendezvous;
pub mod server;

pub use client::find_workers;
pub use config::{BrokerageArgs, BrokerageConfig, Mode};
pub use server::{BrokerageServer, WorkerSettings};
