use tokio::sync::broadcast;

use gridscript_tags::SheetKey;

use crate::queue::ChangeKind;

/// Notification sent to connected clients when a sheet changed. The engine
/// guarantees at most one notification per distinct sheet per flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetChange {
    pub project: String,
    pub sheet: String,
    pub kind: ChangeKind,
}

impl SheetChange {
    pub fn new(key: &SheetKey, kind: ChangeKind) -> Self {
        SheetChange {
            project: key.project.clone(),
            sheet: key.sheet.clone(),
            kind,
        }
    }
}

/// Fan-out hub for sheet-changed notifications
#[derive(Debug, Clone)]
pub struct ChangeHub {
    tx: broadcast::Sender<SheetChange>,
}

impl ChangeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        ChangeHub { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SheetChange> {
        self.tx.subscribe()
    }

    /// Publish a change; a hub with no subscribers drops it silently
    pub fn publish(&self, change: SheetChange) {
        let _ = self.tx.send(change);
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        ChangeHub::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_changes() {
        let hub = ChangeHub::default();
        let mut rx = hub.subscribe();

        let change = SheetChange::new(&SheetKey::new("p", "S"), ChangeKind::Cells);
        hub.publish(change.clone());

        assert_eq!(rx.recv().await.unwrap(), change);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = ChangeHub::default();
        hub.publish(SheetChange::new(
            &SheetKey::new("p", "S"),
            ChangeKind::Structure,
        ));
    }
}
