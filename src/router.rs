//! Topic fan-out dispatch.
//!
//! Publishing to a topic delivers an independent copy of the message to
//! every matching subscription. Subscriptions are visited in creation
//! order; within a subscription, rules are evaluated in creation order
//! and the first match wins, so a subscription receives at most one copy
//! even when several of its rules match. The matched rule's action (if
//! any) is applied to that subscription's copy only.
//!
//! Appends are independent: one subscription's failure (quota) does not
//! abort dispatch to the rest. The report enumerates both outcomes; the
//! facade turns a report with failures into `PartialFanout`.

use tracing::{debug, warn};

use crate::entities::TopicEntity;
use crate::error::FanoutFailure;
use crate::message::Message;
use crate::store::SequenceNumber;

/// Outcome of one topic dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Subscriptions that received a copy, with the copy's sequence number.
    pub delivered: Vec<(String, SequenceNumber)>,
    /// Subscriptions whose append failed.
    pub failed: Vec<FanoutFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fans a message out to every matching subscription of `topic`.
///
/// The duplicate check has already happened by the time this runs; the
/// facade owns that ordering.
pub async fn dispatch_to_topic(topic: &TopicEntity, message: &Message) -> DispatchReport {
    let subscriptions = topic.subscriptions.read().await.clone();
    let mut report = DispatchReport::default();

    for subscription in &subscriptions {
        // First matching rule wins; its action applies to this copy only.
        let matched = {
            let rules = subscription.rules.read().await;
            rules
                .iter()
                .find(|rule| rule.filter.matches(message))
                .map(|rule| (rule.name.clone(), rule.action.clone()))
        };

        let Some((rule_name, action)) = matched else {
            debug!(
                topic = %topic.name,
                subscription = %subscription.name,
                "no rule matched, subscription skipped"
            );
            continue;
        };

        let mut copy = message.clone();
        if let Some(action) = action {
            action.apply(&mut copy);
        }

        match subscription.store.enqueue(copy).await {
            Ok(sequence) => {
                debug!(
                    topic = %topic.name,
                    subscription = %subscription.name,
                    rule = %rule_name,
                    seq = sequence,
                    "copy delivered"
                );
                report.delivered.push((subscription.name.clone(), sequence));
            }
            Err(error) => {
                warn!(
                    topic = %topic.name,
                    subscription = %subscription.name,
                    error = %error,
                    "fan-out append failed"
                );
                report.failed.push(FanoutFailure {
                    subscription: subscription.name.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    report
}
