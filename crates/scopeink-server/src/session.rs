//! Per-connection protocol state.

use crate::hub::{DocumentHub, WriteOutcome};
use scopeink_core::docstore::{DocChange, DocWrite};
use scopeink_core::protocol::{ClientMessage, ServerMessage};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Subscriptions of one WebSocket connection.
#[derive(Debug, Default)]
pub struct Session {
    subscriptions: BTreeMap<u64, String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Handle one client message and return the direct replies.
    pub fn handle(&mut self, hub: &DocumentHub, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Subscribe { sub_id, prefix } => match hub.snapshot(&prefix) {
                Ok(changes) => {
                    debug!("Subscription {} on {}", sub_id, prefix);
                    self.subscriptions.insert(sub_id, prefix);
                    vec![ServerMessage::Snapshot { sub_id, changes }]
                }
                Err(e) => vec![error(e)],
            },
            ClientMessage::Unsubscribe { sub_id } => {
                self.subscriptions.remove(&sub_id);
                Vec::new()
            }
            ClientMessage::Write { path, value, op_id } => {
                match hub.apply(DocWrite { path, value, op_id }) {
                    Ok(outcome) => vec![ServerMessage::Ack {
                        op_id,
                        duplicate: outcome == WriteOutcome::Duplicate,
                    }],
                    Err(e) => {
                        warn!("Rejected write: {}", e);
                        vec![error(e)]
                    }
                }
            }
        }
    }

    /// The message to forward for a broadcast change, if any subscription
    /// covers it. Each change is sent at most once per connection.
    pub fn route(&self, change: &DocChange) -> Option<ServerMessage> {
        self.subscriptions
            .values()
            .any(|prefix| change.path.starts_with(prefix.as_str()))
            .then(|| ServerMessage::Change {
                path: change.path.clone(),
                value: change.value.clone(),
                op_id: change.op_id,
            })
    }
}

fn error(e: impl std::fmt::Display) -> ServerMessage {
    ServerMessage::Error {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopeink_core::ids::OpId;
    use serde_json::json;

    fn subscribe(
        session: &mut Session,
        hub: &DocumentHub,
        sub_id: u64,
        prefix: &str,
    ) -> Vec<ServerMessage> {
        session.handle(
            hub,
            ClientMessage::Subscribe {
                sub_id,
                prefix: prefix.to_string(),
            },
        )
    }

    #[test]
    fn test_subscribe_replies_with_snapshot() {
        let hub = DocumentHub::new();
        let mut writer = Session::new();
        writer.handle(
            &hub,
            ClientMessage::Write {
                path: "projects/p/shapes/s1".to_string(),
                value: Some(json!({"x": 1})),
                op_id: None,
            },
        );

        let mut reader = Session::new();
        match &subscribe(&mut reader, &hub, 1, "projects/p/shapes/")[..] {
            [ServerMessage::Snapshot { sub_id: 1, changes }] => assert_eq!(changes.len(), 1),
            other => panic!("unexpected replies {:?}", other),
        }
    }

    #[test]
    fn test_write_acks_and_flags_duplicates() {
        let hub = DocumentHub::new();
        let mut session = Session::new();
        let op_id = Some(OpId::new());
        let msg = ClientMessage::Write {
            path: "projects/p/shapes/s1".to_string(),
            value: Some(json!(1)),
            op_id,
        };
        assert_eq!(
            session.handle(&hub, msg.clone()),
            vec![ServerMessage::Ack { op_id, duplicate: false }]
        );
        assert_eq!(
            session.handle(&hub, msg),
            vec![ServerMessage::Ack { op_id, duplicate: true }]
        );
    }

    #[test]
    fn test_route_matches_prefix_once() {
        let hub = DocumentHub::new();
        let mut session = Session::new();
        subscribe(&mut session, &hub, 1, "projects/p/shapes/");
        subscribe(&mut session, &hub, 2, "projects/p/");

        let change = DocChange {
            path: "projects/p/shapes/s1".to_string(),
            value: None,
            op_id: None,
        };
        assert!(matches!(session.route(&change), Some(ServerMessage::Change { .. })));

        let other = DocChange {
            path: "projects/q/shapes/s1".to_string(),
            value: None,
            op_id: None,
        };
        assert!(session.route(&other).is_none());

        session.handle(&hub, ClientMessage::Unsubscribe { sub_id: 1 });
        session.handle(&hub, ClientMessage::Unsubscribe { sub_id: 2 });
        assert!(session.route(&change).is_none());
    }

    #[test]
    fn test_bad_prefix_reports_error() {
        let hub = DocumentHub::new();
        let mut session = Session::new();
        assert!(matches!(
            &subscribe(&mut session, &hub, 1, "bogus")[..],
            [ServerMessage::Error { .. }]
        ));
        assert_eq!(session.subscription_count(), 0);
    }
}
