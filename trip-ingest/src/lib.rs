pub mod codec;
pub mod config;
pub mod consumer;
pub mod handler;
pub mod writer;
