// src/multillama/mod.rs

pub mod autonomous;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod event;
pub mod host_registry;
pub mod mentions;
pub mod message_queue;
pub mod network_scan;
pub mod orchestrator;
pub mod participant;
pub mod persistence;
pub mod prompt;
pub mod roles;
pub mod session_store;

pub use orchestrator::Orchestrator;
