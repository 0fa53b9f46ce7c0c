pub mod chunking;
pub mod controller;
pub mod envelope;
pub mod models;
pub mod orchestrator;
pub mod ports;
