use accumulator_bus::BusConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Joins need and solution records flowing through a shared bus and emits a final record once
/// every required answer kind has been observed for a correlation id.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Comma-separated list of bus bootstrap endpoints.
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS")]
    pub kafka_bootstrap_servers: String,

    /// The topic carrying both need/solution inputs and emitted final records.
    #[arg(long, env = "SPLEIS_BEHOV_TOPIC")]
    pub spleis_behov_topic: String,

    /// Username for bus client authentication. Omit to connect without SASL.
    #[arg(long, env = "SERVICE_USER_USERNAME")]
    pub service_user_username: Option<String>,

    /// Password for bus client authentication. Read from the environment only; never given a
    /// default and never logged.
    #[arg(long, env = "SERVICE_USER_PASSWORD")]
    pub service_user_password: Option<String>,

    /// Local path for the state store's on-disk RocksDB section.
    #[arg(long, env = "STATE_DIR", default_value = "./var/accumulator-state")]
    pub state_dir: PathBuf,

    /// Upper bound on the delay between a state write and the offset commit that depends on it.
    #[arg(long, env = "COMMIT_INTERVAL", value_parser = humantime::parse_duration, default_value = "1s")]
    pub commit_interval: std::time::Duration,

    /// The bus consumer group identity for this instance.
    #[arg(long, env = "CONSUMER_GROUP_ID", default_value = "behovsakkumulator")]
    pub consumer_group_id: String,

    /// Suffix appended to the consumer group id to name the state store's changelog topic.
    #[arg(long, env = "CHANGELOG_TOPIC_SUFFIX", default_value = "-changelog")]
    pub changelog_topic_suffix: String,

    /// Local HTTP port for liveness/readiness checks.
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Local HTTP port for the Prometheus scrape endpoint.
    #[arg(long, env = "METRICS_PORT", default_value = "9094")]
    pub metrics_port: u16,

    /// Output format for structured logs.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Cli {
    pub fn changelog_topic(&self) -> String {
        format!("{}{}", self.consumer_group_id, self.changelog_topic_suffix)
    }

    pub fn service_user(&self) -> Option<(String, String)> {
        match (&self.service_user_username, &self.service_user_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            topic: self.spleis_behov_topic.clone(),
            changelog_topic: self.changelog_topic(),
            consumer_group_id: self.consumer_group_id.clone(),
            service_user: self.service_user(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// P9: an explicit CLI flag overrides an environment variable for the same field.
    #[test]
    fn cli_flag_overrides_env_var() {
        std::env::set_var("SPLEIS_BEHOV_TOPIC", "from-env");
        let cli = Cli::parse_from([
            "accumulator",
            "--kafka-bootstrap-servers",
            "localhost:9092",
            "--spleis-behov-topic",
            "from-cli",
        ]);
        assert_eq!(cli.spleis_behov_topic, "from-cli");
        std::env::remove_var("SPLEIS_BEHOV_TOPIC");
    }

    /// P9: with no CLI flag, the environment variable is honored.
    #[test]
    fn env_var_used_when_no_flag() {
        std::env::set_var("COMMIT_INTERVAL", "2500ms");
        let cli = Cli::parse_from([
            "accumulator",
            "--kafka-bootstrap-servers",
            "localhost:9092",
            "--spleis-behov-topic",
            "behov",
        ]);
        assert_eq!(cli.commit_interval, std::time::Duration::from_millis(2500));
        std::env::remove_var("COMMIT_INTERVAL");
    }

    /// P9: with neither a flag nor an environment variable, the default applies.
    #[test]
    fn default_used_when_neither_set() {
        std::env::remove_var("STATE_DIR");
        let cli = Cli::parse_from([
            "accumulator",
            "--kafka-bootstrap-servers",
            "localhost:9092",
            "--spleis-behov-topic",
            "behov",
        ]);
        assert_eq!(cli.state_dir, PathBuf::from("./var/accumulator-state"));
    }

    #[test]
    fn changelog_topic_appends_suffix() {
        let cli = Cli::parse_from([
            "accumulator",
            "--kafka-bootstrap-servers",
            "localhost:9092",
            "--spleis-behov-topic",
            "behov",
            "--consumer-group-id",
            "acc-group",
            "--changelog-topic-suffix",
            "-cl",
        ]);
        assert_eq!(cli.changelog_topic(), "acc-group-cl");
    }
}
