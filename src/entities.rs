//! In-memory registry of queues, topics, subscriptions, and rules.
//!
//! Entities are created and deleted dynamically through the admin surface.
//! Each queue and subscription owns its `MessageStore` (and DLQ); topics
//! have no store of their own; publishing to a topic fans out to the
//! stores of its subscriptions.
//!
//! Queues and topics share one name namespace by default, matching common
//! broker semantics. The `Isolated` policy keeps the namespaces separate;
//! a name resolving to both then resolves to the queue on send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::dedup::DuplicateDetector;
use crate::error::{BrokerError, Result};
use crate::filter::{CorrelationFilter, Filter, SqlAction, SqlFilter};
use crate::store::{DlqStore, EntityConfig, MessageStore};

/// Name of the implicit match-all rule a subscription gets when created
/// without any rules.
pub const DEFAULT_RULE_NAME: &str = "$Default";

const MAX_NAME_LEN: usize = 260;

/// Whether queues and topics share one name namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespacePolicy {
    /// One namespace: a queue and a topic may not share a name.
    #[default]
    Shared,
    /// Separate namespaces for queues and topics.
    Isolated,
}

/// Configuration for a queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub default_message_ttl: Option<Duration>,
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub dead_lettering_on_message_expiration: bool,
    pub requires_duplicate_detection: bool,
    /// Only meaningful when duplicate detection is enabled.
    pub duplicate_detection_history_window: Duration,
    /// Maximum number of messages the queue holds. 0 = unbounded.
    pub max_size: usize,
    /// Sessions are not supported; `true` is rejected at creation.
    pub requires_session: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_message_ttl: None,
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            dead_lettering_on_message_expiration: false,
            requires_duplicate_detection: false,
            duplicate_detection_history_window: Duration::from_secs(60),
            max_size: 0,
            requires_session: false,
        }
    }
}

/// Configuration for a topic.
#[derive(Debug, Clone)]
pub struct TopicOptions {
    /// Fallback TTL for subscriptions that configure none of their own.
    pub default_message_ttl: Option<Duration>,
    pub requires_duplicate_detection: bool,
    pub duplicate_detection_history_window: Duration,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            default_message_ttl: None,
            requires_duplicate_detection: false,
            duplicate_detection_history_window: Duration::from_secs(60),
        }
    }
}

/// Configuration for a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub default_message_ttl: Option<Duration>,
    pub dead_lettering_on_message_expiration: bool,
    /// Maximum number of messages the subscription holds. 0 = unbounded.
    pub max_size: usize,
    /// Sessions are not supported; `true` is rejected at creation.
    pub requires_session: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            default_message_ttl: None,
            dead_lettering_on_message_expiration: false,
            max_size: 0,
            requires_session: false,
        }
    }
}

/// A compiled subscription rule: filter plus optional action, evaluated
/// in creation order during fan-out.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub filter: Filter,
    pub action: Option<SqlAction>,
}

/// Caller-supplied rule definition; compiled (SQL parsed) at creation.
#[derive(Debug, Clone)]
pub struct RuleDescription {
    pub name: String,
    pub filter: FilterDescription,
    /// SQL SET action text, e.g. `SET sys.To = 'audit'`.
    pub action: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FilterDescription {
    /// Accept everything.
    True,
    Correlation(CorrelationFilter),
    /// SQL filter expression text.
    Sql(String),
}

impl RuleDescription {
    pub fn match_all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: FilterDescription::True,
            action: None,
        }
    }

    pub fn correlation(name: impl Into<String>, filter: CorrelationFilter) -> Self {
        Self {
            name: name.into(),
            filter: FilterDescription::Correlation(filter),
            action: None,
        }
    }

    pub fn sql(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: FilterDescription::Sql(expression.into()),
            action: None,
        }
    }

    pub fn with_action(mut self, expression: impl Into<String>) -> Self {
        self.action = Some(expression.into());
        self
    }

    /// Compiles the description, parsing SQL filter and action text.
    /// All syntax errors surface here, at creation time.
    fn compile(&self) -> Result<Rule> {
        validate_name(&self.name)?;
        let filter = match &self.filter {
            FilterDescription::True => Filter::True,
            FilterDescription::Correlation(f) => Filter::Correlation(f.clone()),
            FilterDescription::Sql(expression) => Filter::Sql(SqlFilter::parse(expression)?),
        };
        let action = match &self.action {
            Some(expression) => Some(SqlAction::parse(expression)?),
            None => None,
        };
        Ok(Rule {
            name: self.name.clone(),
            filter,
            action,
        })
    }
}

/// A queue and its runtime state.
pub struct QueueEntity {
    pub name: String,
    pub options: QueueOptions,
    pub store: Arc<MessageStore>,
    pub dedup: Option<Arc<DuplicateDetector>>,
}

/// A topic: no store of its own, just subscriptions in creation order.
pub struct TopicEntity {
    pub name: String,
    pub options: TopicOptions,
    pub dedup: Option<Arc<DuplicateDetector>>,
    pub subscriptions: RwLock<Vec<Arc<SubscriptionEntity>>>,
}

/// A subscription and its runtime state.
pub struct SubscriptionEntity {
    pub name: String,
    pub topic: String,
    pub options: SubscriptionOptions,
    /// Rules in creation order; the first match wins during fan-out.
    pub rules: RwLock<Vec<Rule>>,
    pub store: Arc<MessageStore>,
}

impl SubscriptionEntity {
    /// The subscription's entity path, e.g. `orders/subscriptions/audit`.
    pub fn path(&self) -> String {
        subscription_path(&self.topic, &self.name)
    }
}

/// Builds the canonical subscription path.
pub fn subscription_path(topic: &str, subscription: &str) -> String {
    format!("{topic}/subscriptions/{subscription}")
}

/// Where a send to a named entity lands.
pub enum SendTarget {
    Queue(Arc<QueueEntity>),
    Topic(Arc<TopicEntity>),
}

#[derive(Default)]
struct Registry {
    queues: HashMap<String, Arc<QueueEntity>>,
    topics: HashMap<String, Arc<TopicEntity>>,
}

/// The dynamic entity registry.
pub struct EntityStore {
    policy: NamespacePolicy,
    inner: RwLock<Registry>,
}

impl EntityStore {
    pub fn new(policy: NamespacePolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(Registry::default()),
        }
    }

    pub fn policy(&self) -> NamespacePolicy {
        self.policy
    }

    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        validate_name(name)?;
        validate_queue_options(&options)?;

        let mut registry = self.inner.write().await;
        if registry.queues.contains_key(name) {
            return Err(BrokerError::EntityAlreadyExists(name.to_string()));
        }
        if self.policy == NamespacePolicy::Shared && registry.topics.contains_key(name) {
            return Err(BrokerError::EntityAlreadyExists(name.to_string()));
        }

        let dlq = Arc::new(DlqStore::new(
            format!("{name}/$deadletterqueue"),
            options.lock_duration,
        ));
        let store = Arc::new(MessageStore::new(
            name,
            queue_entity_config(&options),
            dlq,
        ));
        let dedup = options
            .requires_duplicate_detection
            .then(|| Arc::new(DuplicateDetector::new(options.duplicate_detection_history_window)));

        registry.queues.insert(
            name.to_string(),
            Arc::new(QueueEntity {
                name: name.to_string(),
                options,
                store,
                dedup,
            }),
        );
        info!(queue = name, "queue created");
        Ok(())
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.write().await;
        registry
            .queues
            .remove(name)
            .ok_or_else(|| BrokerError::EntityNotFound(name.to_string()))?;
        info!(queue = name, "queue deleted");
        Ok(())
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.inner.read().await.queues.contains_key(name)
    }

    pub async fn create_topic(&self, name: &str, options: TopicOptions) -> Result<()> {
        validate_name(name)?;
        validate_topic_options(&options)?;

        let mut registry = self.inner.write().await;
        if registry.topics.contains_key(name) {
            return Err(BrokerError::EntityAlreadyExists(name.to_string()));
        }
        if self.policy == NamespacePolicy::Shared && registry.queues.contains_key(name) {
            return Err(BrokerError::EntityAlreadyExists(name.to_string()));
        }

        let dedup = options
            .requires_duplicate_detection
            .then(|| Arc::new(DuplicateDetector::new(options.duplicate_detection_history_window)));

        registry.topics.insert(
            name.to_string(),
            Arc::new(TopicEntity {
                name: name.to_string(),
                options,
                dedup,
                subscriptions: RwLock::new(Vec::new()),
            }),
        );
        info!(topic = name, "topic created");
        Ok(())
    }

    /// Deletes a topic and, with it, all of its subscriptions.
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        let mut registry = self.inner.write().await;
        let topic = registry
            .topics
            .remove(name)
            .ok_or_else(|| BrokerError::EntityNotFound(name.to_string()))?;
        let subscriptions = topic.subscriptions.read().await.len();
        info!(topic = name, subscriptions, "topic deleted");
        Ok(())
    }

    pub async fn topic_exists(&self, name: &str) -> bool {
        self.inner.read().await.topics.contains_key(name)
    }

    pub async fn create_subscription(
        &self,
        topic_name: &str,
        name: &str,
        options: SubscriptionOptions,
        rules: Vec<RuleDescription>,
    ) -> Result<()> {
        validate_name(name)?;
        validate_subscription_options(&options)?;

        // Compile (and so validate) rules before touching the registry.
        let compiled = if rules.is_empty() {
            vec![Rule {
                name: DEFAULT_RULE_NAME.to_string(),
                filter: Filter::True,
                action: None,
            }]
        } else {
            let mut compiled = Vec::with_capacity(rules.len());
            for description in &rules {
                compiled.push(description.compile()?);
            }
            for (i, rule) in compiled.iter().enumerate() {
                if compiled[..i].iter().any(|r| r.name == rule.name) {
                    return Err(BrokerError::InvalidConfiguration(format!(
                        "duplicate rule name '{}'",
                        rule.name
                    )));
                }
            }
            compiled
        };

        let topic = self.topic(topic_name).await?;
        let mut subscriptions = topic.subscriptions.write().await;
        let path = subscription_path(topic_name, name);
        if subscriptions.iter().any(|s| s.name == name) {
            return Err(BrokerError::EntityAlreadyExists(path));
        }

        let default_ttl = options
            .default_message_ttl
            .or(topic.options.default_message_ttl);
        let dlq = Arc::new(DlqStore::new(
            format!("{path}/$deadletterqueue"),
            options.lock_duration,
        ));
        let store = Arc::new(MessageStore::new(
            path.clone(),
            subscription_entity_config(&options, default_ttl),
            dlq,
        ));

        subscriptions.push(Arc::new(SubscriptionEntity {
            name: name.to_string(),
            topic: topic_name.to_string(),
            options,
            rules: RwLock::new(compiled),
            store,
        }));
        info!(subscription = %path, "subscription created");
        Ok(())
    }

    pub async fn delete_subscription(&self, topic_name: &str, name: &str) -> Result<()> {
        let topic = self.topic(topic_name).await?;
        let mut subscriptions = topic.subscriptions.write().await;
        let idx = subscriptions
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| BrokerError::EntityNotFound(subscription_path(topic_name, name)))?;
        subscriptions.remove(idx);
        info!(subscription = %subscription_path(topic_name, name), "subscription deleted");
        Ok(())
    }

    pub async fn subscription_exists(&self, topic_name: &str, name: &str) -> bool {
        match self.topic(topic_name).await {
            Ok(topic) => topic.subscriptions.read().await.iter().any(|s| s.name == name),
            Err(_) => false,
        }
    }

    pub async fn create_rule(
        &self,
        topic_name: &str,
        subscription_name: &str,
        description: RuleDescription,
    ) -> Result<()> {
        let rule = description.compile()?;
        let subscription = self.subscription(topic_name, subscription_name).await?;
        let mut rules = subscription.rules.write().await;
        if rules.iter().any(|r| r.name == rule.name) {
            return Err(BrokerError::EntityAlreadyExists(format!(
                "{}/rules/{}",
                subscription.path(),
                rule.name
            )));
        }
        info!(
            subscription = %subscription.path(),
            rule = %rule.name,
            "rule created"
        );
        rules.push(rule);
        Ok(())
    }

    pub async fn delete_rule(
        &self,
        topic_name: &str,
        subscription_name: &str,
        rule_name: &str,
    ) -> Result<()> {
        let subscription = self.subscription(topic_name, subscription_name).await?;
        let mut rules = subscription.rules.write().await;
        let idx = rules.iter().position(|r| r.name == rule_name).ok_or_else(|| {
            BrokerError::EntityNotFound(format!("{}/rules/{rule_name}", subscription.path()))
        })?;
        rules.remove(idx);
        Ok(())
    }

    pub async fn queue(&self, name: &str) -> Result<Arc<QueueEntity>> {
        self.inner
            .read()
            .await
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::EntityNotFound(name.to_string()))
    }

    pub async fn topic(&self, name: &str) -> Result<Arc<TopicEntity>> {
        self.inner
            .read()
            .await
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::EntityNotFound(name.to_string()))
    }

    pub async fn subscription(
        &self,
        topic_name: &str,
        name: &str,
    ) -> Result<Arc<SubscriptionEntity>> {
        let topic = self.topic(topic_name).await?;
        let subscriptions = topic.subscriptions.read().await;
        subscriptions
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| BrokerError::EntityNotFound(subscription_path(topic_name, name)))
    }

    /// Resolves a send target by name. With the `Isolated` policy a queue
    /// shadows a topic of the same name.
    pub async fn send_target(&self, name: &str) -> Result<SendTarget> {
        let registry = self.inner.read().await;
        if let Some(queue) = registry.queues.get(name) {
            return Ok(SendTarget::Queue(queue.clone()));
        }
        if let Some(topic) = registry.topics.get(name) {
            return Ok(SendTarget::Topic(topic.clone()));
        }
        Err(BrokerError::EntityNotFound(name.to_string()))
    }

    /// Every message store in the registry (queues and subscriptions),
    /// for the maintenance sweep.
    pub async fn stores(&self) -> Vec<Arc<MessageStore>> {
        let registry = self.inner.read().await;
        let mut stores: Vec<Arc<MessageStore>> =
            registry.queues.values().map(|q| q.store.clone()).collect();
        for topic in registry.topics.values() {
            for subscription in topic.subscriptions.read().await.iter() {
                stores.push(subscription.store.clone());
            }
        }
        stores
    }

    /// Every duplicate detector in the registry, for the maintenance sweep.
    pub async fn detectors(&self) -> Vec<Arc<DuplicateDetector>> {
        let registry = self.inner.read().await;
        registry
            .queues
            .values()
            .filter_map(|q| q.dedup.clone())
            .chain(registry.topics.values().filter_map(|t| t.dedup.clone()))
            .collect()
    }
}

fn queue_entity_config(options: &QueueOptions) -> EntityConfig {
    EntityConfig {
        lock_duration: options.lock_duration,
        max_delivery_count: options.max_delivery_count,
        default_message_ttl: options.default_message_ttl,
        dead_lettering_on_expiration: options.dead_lettering_on_message_expiration,
        max_size: options.max_size,
    }
}

fn subscription_entity_config(
    options: &SubscriptionOptions,
    default_message_ttl: Option<Duration>,
) -> EntityConfig {
    EntityConfig {
        lock_duration: options.lock_duration,
        max_delivery_count: options.max_delivery_count,
        default_message_ttl,
        dead_lettering_on_expiration: options.dead_lettering_on_message_expiration,
        max_size: options.max_size,
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(BrokerError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_queue_options(options: &QueueOptions) -> Result<()> {
    if options.requires_session {
        return Err(BrokerError::UnsupportedConfiguration(
            "sessions are not supported".to_string(),
        ));
    }
    if options.max_delivery_count == 0 {
        return Err(BrokerError::InvalidConfiguration(
            "max_delivery_count must be at least 1".to_string(),
        ));
    }
    if options.requires_duplicate_detection
        && options.duplicate_detection_history_window.is_zero()
    {
        return Err(BrokerError::InvalidConfiguration(
            "duplicate_detection_history_window must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_topic_options(options: &TopicOptions) -> Result<()> {
    if options.requires_duplicate_detection
        && options.duplicate_detection_history_window.is_zero()
    {
        return Err(BrokerError::InvalidConfiguration(
            "duplicate_detection_history_window must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_subscription_options(options: &SubscriptionOptions) -> Result<()> {
    if options.requires_session {
        return Err(BrokerError::UnsupportedConfiguration(
            "sessions are not supported".to_string(),
        ));
    }
    if options.max_delivery_count == 0 {
        return Err(BrokerError::InvalidConfiguration(
            "max_delivery_count must be at least 1".to_string(),
        ));
    }
    Ok(())
}
