pub mod config;
pub mod content_store;
pub mod engine;
pub mod pipeline;
pub mod protocol;
pub mod scene;
pub mod transport;
