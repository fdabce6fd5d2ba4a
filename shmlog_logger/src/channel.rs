//! Ingress channel: the unbounded multi-producer queue feeding the workers.

use crate::error::LoggerResult;
use crate::item::LogItem;
use crossbeam_queue::SegQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free FIFO of pending items.
///
/// Growth is unbounded: producers are never throttled by slow persistence.
/// A slow disk shows up as queue depth, not as producer errors.
#[derive(Debug, Default)]
pub(crate) struct IngressChannel {
    queue: SegQueue<LogItem>,
    submitted: AtomicU64,
}

impl IngressChannel {
    pub(crate) fn push(&self, item: LogItem) {
        self.queue.push(item);
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pop(&self) -> Option<LogItem> {
        self.queue.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

/// Cloneable submit handle for threads that do not own the logger.
#[derive(Debug, Clone)]
pub struct LogProducer {
    channel: Arc<IngressChannel>,
}

impl LogProducer {
    pub(crate) fn new(channel: Arc<IngressChannel>) -> Self {
        Self { channel }
    }

    /// Enqueue `item`. Never blocks on disk I/O.
    pub fn submit(&self, item: LogItem) -> LoggerResult<()> {
        item.validate()?;
        self.channel.push(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_counters() {
        let channel = Arc::new(IngressChannel::default());
        let producer = LogProducer::new(Arc::clone(&channel));

        producer.submit(LogItem::new(1, 10, vec![1])).unwrap();
        producer.clone().submit(LogItem::new(1, 20, vec![2])).unwrap();
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.submitted(), 2);

        assert_eq!(channel.pop().map(|i| i.timestamp_us), Some(10));
        assert_eq!(channel.pop().map(|i| i.timestamp_us), Some(20));
        assert!(channel.is_empty());
    }

    #[test]
    fn test_invalid_item_not_enqueued() {
        let channel = Arc::new(IngressChannel::default());
        let producer = LogProducer::new(Arc::clone(&channel));
        assert!(producer.submit(LogItem::new(1, 0, vec![1, 2])).is_err());
        assert!(channel.is_empty());
    }
}
