//! Declarative topology configuration.
//!
//! A topology file pre-provisions queues, topics, subscriptions, and rules
//! at startup. [`crate::Broker::from_topology`] applies it through the
//! same admin operations callers use, so a topology entity behaves
//! exactly like one created at runtime.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::entities::{
    FilterDescription, QueueOptions, RuleDescription, SubscriptionOptions, TopicOptions,
};
use crate::filter::CorrelationFilter;
use crate::message::PropertyValue;

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub lock_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_delivery_count: Option<u32>,
    #[serde(default)]
    pub default_message_ttl_secs: Option<u64>,
    #[serde(default)]
    pub dead_lettering_on_message_expiration: bool,
    #[serde(default)]
    pub requires_duplicate_detection: bool,
    #[serde(default)]
    pub duplicate_detection_window_secs: Option<u64>,
    #[serde(default)]
    pub max_size: usize,
    #[serde(default)]
    pub requires_session: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock_duration_secs: None,
            max_delivery_count: None,
            default_message_ttl_secs: None,
            dead_lettering_on_message_expiration: false,
            requires_duplicate_detection: false,
            duplicate_detection_window_secs: None,
            max_size: 0,
            requires_session: false,
        }
    }

    pub fn options(&self) -> QueueOptions {
        let defaults = QueueOptions::default();
        QueueOptions {
            default_message_ttl: self.default_message_ttl_secs.map(Duration::from_secs),
            lock_duration: self
                .lock_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_duration),
            max_delivery_count: self.max_delivery_count.unwrap_or(defaults.max_delivery_count),
            dead_lettering_on_message_expiration: self.dead_lettering_on_message_expiration,
            requires_duplicate_detection: self.requires_duplicate_detection,
            duplicate_detection_history_window: self
                .duplicate_detection_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.duplicate_detection_history_window),
            max_size: self.max_size,
            requires_session: self.requires_session,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default)]
    pub default_message_ttl_secs: Option<u64>,
    #[serde(default)]
    pub requires_duplicate_detection: bool,
    #[serde(default)]
    pub duplicate_detection_window_secs: Option<u64>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl TopicConfig {
    pub fn options(&self) -> TopicOptions {
        let defaults = TopicOptions::default();
        TopicOptions {
            default_message_ttl: self.default_message_ttl_secs.map(Duration::from_secs),
            requires_duplicate_detection: self.requires_duplicate_detection,
            duplicate_detection_history_window: self
                .duplicate_detection_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.duplicate_detection_history_window),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    pub name: String,
    #[serde(default)]
    pub lock_duration_secs: Option<u64>,
    #[serde(default)]
    pub max_delivery_count: Option<u32>,
    #[serde(default)]
    pub default_message_ttl_secs: Option<u64>,
    #[serde(default)]
    pub dead_lettering_on_message_expiration: bool,
    #[serde(default)]
    pub max_size: usize,
    #[serde(default)]
    pub requires_session: bool,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl SubscriptionConfig {
    pub fn options(&self) -> SubscriptionOptions {
        let defaults = SubscriptionOptions::default();
        SubscriptionOptions {
            lock_duration: self
                .lock_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_duration),
            max_delivery_count: self.max_delivery_count.unwrap_or(defaults.max_delivery_count),
            default_message_ttl: self.default_message_ttl_secs.map(Duration::from_secs),
            dead_lettering_on_message_expiration: self.dead_lettering_on_message_expiration,
            max_size: self.max_size,
            requires_session: self.requires_session,
        }
    }

    /// Rule descriptions in file order. An empty list means the implicit
    /// match-all rule.
    pub fn rule_descriptions(&self) -> Vec<RuleDescription> {
        self.rules.iter().map(RuleConfig::description).collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    pub name: String,
    pub filter: FilterConfig,
    #[serde(default)]
    pub action: Option<String>,
}

impl RuleConfig {
    fn description(&self) -> RuleDescription {
        let filter = match &self.filter {
            FilterConfig::Correlation {
                correlation_id,
                message_id,
                to,
                reply_to,
                subject,
                session_id,
                reply_to_session_id,
                content_type,
                properties,
            } => FilterDescription::Correlation(CorrelationFilter {
                correlation_id: correlation_id.clone(),
                message_id: message_id.clone(),
                to: to.clone(),
                reply_to: reply_to.clone(),
                subject: subject.clone(),
                session_id: session_id.clone(),
                reply_to_session_id: reply_to_session_id.clone(),
                content_type: content_type.clone(),
                properties: properties
                    .iter()
                    .map(|(k, v)| (k.clone(), PropertyValue::String(v.clone())))
                    .collect(),
            }),
            FilterConfig::Sql { expression } => FilterDescription::Sql(expression.clone()),
        };
        RuleDescription {
            name: self.name.clone(),
            filter,
            action: self.action.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterConfig {
    Correlation {
        #[serde(default)]
        correlation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        reply_to: Option<String>,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        reply_to_session_id: Option<String>,
        #[serde(default)]
        content_type: Option<String>,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    Sql {
        expression: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Topology {
    pub queues: Vec<QueueConfig>,
    pub topics: Vec<TopicConfig>,
}

impl Topology {
    /// Loads topology from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let topology: Topology = serde_yaml::from_str(&content)?;
        Ok(topology)
    }

    /// Parses topology from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let topology: Topology = serde_yaml::from_str(yaml)?;
        Ok(topology)
    }
}
