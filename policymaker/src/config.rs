use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use policymaker_common::retry::RetryPolicy;
use url::Url;

use crate::error::ConfigError;
use crate::groups::PolicyGroups;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "AMQP_API_URL", default = "http://localhost:15672")]
    pub api_url: ApiUrl,

    #[envconfig(from = "AMQP_USER", default = "admin")]
    pub user: String,

    #[envconfig(from = "AMQP_PASSWORD", default = "admin")]
    pub password: String,

    /// JSON object of bucket index to host names, validated by `Config::policy_groups`.
    #[envconfig(from = "AMQP_POLICY_GROUPS")]
    pub policy_groups: String,

    #[envconfig(from = "AMQP_DRY_RUN", default = "false")]
    pub dry_run: bool,

    /// Sleep between cycles.
    #[envconfig(from = "AMQP_SLEEP", default = "20000")]
    pub sleep: EnvMsDuration,

    /// Sleep between two readiness polls of a queue.
    #[envconfig(from = "AMQP_WAIT_SLEEP", default = "2000")]
    pub wait_sleep: EnvMsDuration,

    /// Unset means wait for readiness for as long as it takes.
    #[envconfig(from = "AMQP_READINESS_TIMEOUT")]
    pub readiness_timeout: Option<EnvMsDuration>,

    #[envconfig(from = "AMQP_QUEUES_DELTA", default = "3")]
    pub queues_delta: usize,

    #[envconfig(from = "AMQP_BALANCING", default = "true")]
    pub balancing: bool,

    #[envconfig(from = "AMQP_RUN_ONCE", default = "false")]
    pub run_once: bool,

    #[envconfig(from = "AMQP_NODE_TAG", default = "rabbit")]
    pub node_tag: NonEmptyString,

    #[envconfig(from = "AMQP_REQUEST_TIMEOUT", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "AMQP_LIVENESS_DEADLINE", default = "600000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(nested = true)]
    pub broker_retry: BrokerRetryConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn policy_groups(&self) -> Result<PolicyGroups, ConfigError> {
        self.policy_groups.parse()
    }
}

#[derive(Envconfig, Clone)]
pub struct BrokerRetryConfig {
    #[envconfig(from = "AMQP_BROKER_RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "AMQP_BROKER_RETRY_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "AMQP_BROKER_RETRY_MAXIMUM_INTERVAL", default = "30000")]
    pub maximum_interval: EnvMsDuration,
}

impl BrokerRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Base URL of the management API. Must be http(s), so that API paths can be appended to it.
#[derive(Debug, Clone)]
pub struct ApiUrl(pub Url);

impl FromStr for ApiUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|_| ConfigError::InvalidApiUrl(s.to_owned()))?;

        match url.scheme() {
            "http" | "https" if !url.cannot_be_a_base() => Ok(ApiUrl(url)),
            _ => Err(ConfigError::InvalidApiUrl(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required_env() -> HashMap<String, String> {
        HashMap::from([(
            "AMQP_POLICY_GROUPS".to_owned(),
            r#"{"0": ["rabbit-dc1-1"], "1": ["rabbit-dc1-2"]}"#.to_owned(),
        )])
    }

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&required_env()).expect("invalid configuration");

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.api_url.0.as_str(), "http://localhost:15672/");
        assert!(!config.dry_run);
        assert!(config.balancing);
        assert!(!config.run_once);
        assert_eq!(config.queues_delta, 3);
        assert_eq!(config.sleep.0, time::Duration::from_secs(20));
        assert_eq!(config.wait_sleep.0, time::Duration::from_secs(2));
        assert!(config.readiness_timeout.is_none());
        assert_eq!(config.node_tag.as_str(), "rabbit");
        assert_eq!(config.policy_groups().unwrap().count().get(), 2);
        assert_eq!(
            config.broker_retry.policy().time_until_next_retry(10),
            time::Duration::from_secs(30)
        );
    }

    #[test]
    fn test_overrides() {
        let mut env = required_env();
        env.insert("AMQP_DRY_RUN".to_owned(), "true".to_owned());
        env.insert("AMQP_READINESS_TIMEOUT".to_owned(), "60000".to_owned());
        env.insert("AMQP_QUEUES_DELTA".to_owned(), "0".to_owned());
        env.insert(
            "AMQP_API_URL".to_owned(),
            "https://rabbit.internal:15671".to_owned(),
        );

        let config = Config::init_from_hashmap(&env).expect("invalid configuration");

        assert!(config.dry_run);
        assert_eq!(config.queues_delta, 0);
        assert_eq!(
            config.readiness_timeout.map(|timeout| timeout.0),
            Some(time::Duration::from_secs(60))
        );
        assert_eq!(config.api_url.0.scheme(), "https");
    }

    #[test]
    fn test_policy_groups_are_required() {
        assert!(Config::init_from_hashmap(&HashMap::new()).is_err());
    }

    #[test]
    fn test_api_url_needs_http_scheme() {
        // A bare host:port parses as a URL with scheme "localhost".
        assert!("localhost:15672".parse::<ApiUrl>().is_err());
        assert!("ftp://localhost:15672".parse::<ApiUrl>().is_err());
        assert!("http://localhost:15672".parse::<ApiUrl>().is_ok());
    }

    #[test]
    fn test_empty_node_tag_is_rejected() {
        let mut env = required_env();
        env.insert("AMQP_NODE_TAG".to_owned(), "".to_owned());

        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
