pub mod audit;
pub mod config;
pub mod errors;
pub mod events;
pub mod gates;
pub mod graph;
pub mod hub;
pub mod ids;
pub mod knowledge;
pub mod orchestrator;
pub mod persona;
pub mod stage;
pub mod store;
pub mod task;
pub mod tracker;
pub mod watcher;

pub use errors::EngineError;
pub use orchestrator::Engine;
