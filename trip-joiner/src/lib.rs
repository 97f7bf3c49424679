pub mod changes;
pub mod completion;
pub mod config;
pub mod listener;
pub mod trigger;
pub mod worker;
