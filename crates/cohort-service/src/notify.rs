//! Membership-change notifications.

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Added,
    Removed,
}

/// Sent to a user whose direct membership in a named group was changed
/// by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipNotification {
    pub realm_id: Uuid,
    pub group_id: Uuid,
    pub group_name: String,
    pub acting_user_id: Uuid,
    pub acting_user_name: String,
    pub recipient_id: Uuid,
    pub change: MembershipChange,
}

impl MembershipNotification {
    /// Message body addressed to the recipient.
    pub fn content(&self) -> String {
        match self.change {
            MembershipChange::Added => format!(
                "{} added you to the group {}.",
                self.acting_user_name, self.group_name
            ),
            MembershipChange::Removed => format!(
                "{} removed you from the group {}.",
                self.acting_user_name, self.group_name
            ),
        }
    }
}

/// Delivery is fire-and-forget: a failed delivery never fails the
/// mutation that triggered it.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: MembershipNotification);
}

/// Forwards notifications into an unbounded channel for a delivery worker.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<MembershipNotification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MembershipNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: MembershipNotification) {
        if let Err(err) = self.sender.send(notification) {
            debug!(recipient_id = %err.0.recipient_id, "Notification receiver closed, dropping");
        }
    }
}
