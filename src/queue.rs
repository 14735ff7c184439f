use crate::message::ClientMessage;
use std::collections::VecDeque;

/// FIFO buffer of control frames waiting for an open socket.
///
/// Frames are drained in enqueue order once the connection opens and are
/// not retried individually afterwards.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    frames: VecDeque<ClientMessage>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: ClientMessage) {
        self.frames.push_back(frame);
    }

    /// Take every pending frame, oldest first, leaving the queue empty
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(name: &str) -> ClientMessage {
        ClientMessage::Subscribe {
            channel: name.to_string(),
        }
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = OutboundQueue::new();
        queue.push(subscribe("x"));
        queue.push(ClientMessage::Heartbeat);
        queue.push(subscribe("z"));

        assert_eq!(queue.len(), 3);
        assert_eq!(
            queue.drain(),
            vec![subscribe("x"), ClientMessage::Heartbeat, subscribe("z")]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::new();
        queue.push(subscribe("x"));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }
}
