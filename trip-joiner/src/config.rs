use envconfig::Envconfig;

use trip_common::config::{EnvMsDuration, NonEmptyString, StoreConfig};

use crate::completion::CompletionWriteMode;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3311")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub store: StoreConfig,

    pub workflow_id: NonEmptyString,

    pub workflow_trigger_url: NonEmptyString,

    #[envconfig(default = "5000")]
    pub trigger_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "100")]
    pub notification_batch_size: i64,

    #[envconfig(default = "64")]
    pub max_concurrent_notifications: usize,

    #[envconfig(default = "overwrite")]
    pub completion_write_mode: CompletionWriteMode,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
