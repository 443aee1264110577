// src/notifier.rs
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::model::{ActionType, MonthYear, ProcessingStatus};

/// Topics the engine publishes on. Subscribers pick one topic per
/// subscription; the string forms are what clients see on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    ToilUpdated,
    ActionToggled,
    ApprovalUpdated,
    ToilMonthStateUpdated,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ToilUpdated => "toil-updated",
            Topic::ActionToggled => "action-toggled",
            Topic::ApprovalUpdated => "approval-updated",
            Topic::ToilMonthStateUpdated => "toil-month-state-updated",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change pushed to subscribers after a mutation has been committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all_fields = "camelCase", tag = "topic")]
pub enum ChangeEvent {
    #[serde(rename = "toil-updated")]
    ToilUpdated {
        user_id: String,
        month_year: MonthYear,
    },
    #[serde(rename = "action-toggled")]
    ActionToggled {
        user_id: String,
        date: NaiveDate,
        action: ActionType,
        active: bool,
    },
    #[serde(rename = "approval-updated")]
    ApprovalUpdated {
        record_id: String,
        user_id: String,
        month: MonthYear,
        status: ProcessingStatus,
    },
    #[serde(rename = "toil-month-state-updated")]
    ToilMonthStateUpdated {
        user_id: String,
        month: MonthYear,
    },
}

impl ChangeEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ChangeEvent::ToilUpdated { .. } => Topic::ToilUpdated,
            ChangeEvent::ActionToggled { .. } => Topic::ActionToggled,
            ChangeEvent::ApprovalUpdated { .. } => Topic::ApprovalUpdated,
            ChangeEvent::ToilMonthStateUpdated { .. } => Topic::ToilMonthStateUpdated,
        }
    }
}

struct NotifierInner {
    next_id: u64,
    subscribers: HashMap<Topic, Vec<(u64, UnboundedSender<ChangeEvent>)>>,
}

/// In-process fan-out of ledger changes. Publishing never blocks: events go
/// over unbounded channels and subscribers whose receiving end is gone are
/// pruned on the next publish.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<Mutex<NotifierInner>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NotifierInner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.entry(topic).or_default().push((id, tx));
        debug!("Subscription {} added on topic '{}'", id, topic);
        Subscription {
            topic,
            id,
            rx,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        let topic = event.topic();
        let mut inner = self.inner.lock().unwrap();
        let Some(subs) = inner.subscribers.get_mut(&topic) else {
            return;
        };
        subs.retain(|(id, tx)| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Dropping closed subscription {} on topic '{}'", id, topic);
                false
            }
        });
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .get(&topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn unsubscribe(inner: &Mutex<NotifierInner>, topic: Topic, id: u64) {
        let mut inner = inner.lock().unwrap();
        if let Some(subs) = inner.subscribers.get_mut(&topic) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's end of a topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    id: u64,
    rx: UnboundedReceiver<ChangeEvent>,
    notifier: Weak<Mutex<NotifierInner>>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive for callers draining after a known mutation.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            ChangeNotifier::unsubscribe(&inner, self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod notifier_tests {
    use super::*;

    fn toggled(user_id: &str, active: bool) -> ChangeEvent {
        ChangeEvent::ActionToggled {
            user_id: user_id.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date"),
            action: ActionType::Sick,
            active,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_their_topic_only() {
        let notifier = ChangeNotifier::new();
        let mut toggles = notifier.subscribe(Topic::ActionToggled);
        let mut approvals = notifier.subscribe(Topic::ApprovalUpdated);

        notifier.publish(toggled("u1", true));

        let event = toggles.recv().await.expect("event");
        assert_eq!(event.topic(), Topic::ActionToggled);
        assert!(approvals.try_recv().is_none());
    }

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let notifier = ChangeNotifier::new();
        let mut first = notifier.subscribe(Topic::ActionToggled);
        let mut second = notifier.subscribe(Topic::ActionToggled);

        notifier.publish(toggled("u1", true));

        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let notifier = ChangeNotifier::new();
        let first = notifier.subscribe(Topic::ToilUpdated);
        let second = notifier.subscribe(Topic::ToilUpdated);
        assert_eq!(notifier.subscriber_count(Topic::ToilUpdated), 2);

        drop(first);
        assert_eq!(notifier.subscriber_count(Topic::ToilUpdated), 1);
        drop(second);
        assert_eq!(notifier.subscriber_count(Topic::ToilUpdated), 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let notifier = ChangeNotifier::new();
        notifier.publish(toggled("u1", false));
        assert_eq!(notifier.subscriber_count(Topic::ActionToggled), 0);
    }

    #[test]
    fn event_serializes_with_topic_tag() {
        let event = toggled("u1", true);
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["topic"], "action-toggled");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["active"], true);
    }
}
