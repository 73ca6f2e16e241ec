//! Tunnel Notifications
//!
//! Observers of tunnel creation and state changes. The daemon logs them;
//! a status front end can subscribe through [`BroadcastNotifier`].

use tokio::sync::broadcast;

use crate::tunnel::{TunnelField, TunnelRecord};

/// Notification collaborator
pub trait Notifier: Send + Sync {
    fn tunnel_added(&self, record: &TunnelRecord);

    fn tunnel_state_changed(&self, record: &TunnelRecord, fields: &[TunnelField]);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn tunnel_added(&self, record: &TunnelRecord) {
        tracing::info!(
            "Tunnel {} added: {} {} <-> {} ({}) on {}",
            record.id,
            record.family,
            record.local_tunnel_addr,
            record.remote_tunnel_addr,
            record.remote_phys_addr,
            record.local_interface_name
        );
    }

    fn tunnel_state_changed(&self, record: &TunnelRecord, fields: &[TunnelField]) {
        tracing::info!("Tunnel {} is now {} ({:?})", record.id, record.state, fields);
    }
}

/// Event published by [`BroadcastNotifier`]
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Added(TunnelRecord),
    StateChanged(TunnelRecord, Vec<TunnelField>),
}

/// Publishes notifications on a broadcast channel and logs them
pub struct BroadcastNotifier {
    tx: broadcast::Sender<TunnelEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn tunnel_added(&self, record: &TunnelRecord) {
        LogNotifier.tunnel_added(record);
        // no subscribers is fine
        let _ = self.tx.send(TunnelEvent::Added(record.clone()));
    }

    fn tunnel_state_changed(&self, record: &TunnelRecord, fields: &[TunnelField]) {
        LogNotifier.tunnel_state_changed(record, fields);
        let _ = self.tx.send(TunnelEvent::StateChanged(record.clone(), fields.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::tests::sample_record;
    use crate::tunnel::TunnelState;

    #[tokio::test]
    async fn test_broadcast_events() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        let mut record = sample_record();
        notifier.tunnel_added(&record);
        record.set_state(TunnelState::Up);
        notifier.tunnel_state_changed(&record, &[TunnelField::State]);

        assert!(matches!(rx.recv().await.unwrap(), TunnelEvent::Added(r) if r.id == record.id));
        match rx.recv().await.unwrap() {
            TunnelEvent::StateChanged(r, fields) => {
                assert!(r.is_up());
                assert_eq!(fields, vec![TunnelField::State]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
