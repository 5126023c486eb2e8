// src/transfer/events.rs
//! Transfer lifecycle events and their fan-out

use std::sync::{Arc, Mutex, PoisonError};

use log::{trace, warn};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Connecting { transfer_id: String },
    Started { transfer_id: String },
    Progress { transfer_id: String, bytes_transferred: u64, total_size: u64 },
    Paused { transfer_id: String, offset: u64 },
    Resumed { transfer_id: String, offset: u64 },
    Completed { transfer_id: String },
    Cancelled { transfer_id: String },
    Failed { transfer_id: String, error: String },
}

/// Subscriber list; a dropped receiver is pruned on the next emit
#[derive(Clone)]
pub(crate) struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<TransferEvent>>>>,
    buffer: usize,
}

impl EventSink {
    pub fn new(buffer: usize) -> Self {
        Self { subscribers: Arc::new(Mutex::new(Vec::new())), buffer: buffer.max(1) }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<TransferEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    pub fn emit(&self, event: TransferEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Progress floods are expected; anything else is worth a warning
                if matches!(event, TransferEvent::Progress { .. }) {
                    trace!("Subscriber full, dropped progress event");
                } else {
                    warn!("Subscriber full, dropped {:?}", event);
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let sink = EventSink::new(4);
        let mut kept = sink.subscribe();
        let dropped = sink.subscribe();
        drop(dropped);

        sink.emit(TransferEvent::Started { transfer_id: "t".into() });
        assert_eq!(kept.recv().await, Some(TransferEvent::Started { transfer_id: "t".into() }));
        assert_eq!(sink.subscribers.lock().unwrap().len(), 1);
    }
}
