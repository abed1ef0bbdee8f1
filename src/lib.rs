pub mod audio;
pub mod config_loader;
pub mod devices;
pub mod ear;
pub mod engine;
pub mod listen;
pub mod models;
pub mod speaker;
pub mod synth;
pub mod text;
pub mod web;
pub mod wss;
