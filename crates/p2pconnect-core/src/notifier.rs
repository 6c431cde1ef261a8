use crate::error::ReceiveError;
use crate::resource::TransferResult;
use tokio::sync::mpsc;

/// Delivers receiver-side events to the application. All calls are
/// fire-and-forget and must not block: the consent decision comes back
/// later through [`crate::ReceiverHandle::decide_acceptance`].
pub trait Notifier: Send + Sync {
    /// A peer wants to start transfer `transfer_id` and needs consent.
    fn accept_transfer_requested(&self, transfer_id: &str);

    /// Called exactly once per successful transfer.
    fn transfer_complete(&self, result: TransferResult);

    fn transfer_failed(&self, error: ReceiveError);
}

/// Receiver events as plain values, for applications that prefer a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    AcceptTransfer { transfer_id: String },
    TransferComplete(TransferResult),
    TransferFailed(ReceiveError),
}

/// [`Notifier`] that forwards every event onto an unbounded channel.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ReceiverEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ReceiverEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Receiver event dropped, nobody is listening");
        }
    }
}

impl Notifier for ChannelNotifier {
    fn accept_transfer_requested(&self, transfer_id: &str) {
        self.forward(ReceiverEvent::AcceptTransfer {
            transfer_id: transfer_id.to_string(),
        });
    }

    fn transfer_complete(&self, result: TransferResult) {
        self.forward(ReceiverEvent::TransferComplete(result));
    }

    fn transfer_failed(&self, error: ReceiveError) {
        self.forward(ReceiverEvent::TransferFailed(error));
    }
}
