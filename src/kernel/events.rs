//! Scheduler messages
//!
//! Everything asynchronous reaches the core as a queued message: flash
//! completions, inbound frames, watchdog expiries, finished fetches. The
//! node dispatches them one at a time, each to completion, in FIFO order.
//!
//! Results meant for a module (the original requester of an operation) are
//! [`Notification`]s, collected by the node for the module layer to pick up.

use super::ModuleId;
use super::codemem::CodeHandle;
use super::fetcher::{FetchOutcome, ModuleKey};
use super::melf::LoadError;
use crate::platform::NodeAddr;
use std::collections::VecDeque;

/// Messages handled by the node dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A flash cycle started on behalf of `requester` finished
    FlashDone {
        handle: CodeHandle,
        requester: ModuleId,
    },
    /// Frame received from a neighbour
    Packet { from: NodeAddr, frame: Vec<u8> },
    /// Fetch watchdog expired
    FetchTimeout { key: ModuleKey },
    /// Every fragment of a fetch arrived; the image is ready to load
    FetchComplete {
        key: ModuleKey,
        handle: CodeHandle,
        requester: ModuleId,
    },
}

/// Results delivered to modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A split-phase flash operation on `handle` finished
    FlashDone { handle: CodeHandle },
    /// A fetch left the transfer phase
    FetchDone { key: ModuleKey, outcome: FetchOutcome },
    /// A module was relocated, marked executable and linked
    ModuleLoaded {
        pid: ModuleId,
        header_addr: u32,
        /// Provided plus subscribed functions in its header
        function_count: usize,
    },
    /// A module image was rejected; its allocation has been freed
    LoadFailed { error: LoadError },
}

/// FIFO message queue
#[derive(Debug, Default)]
pub struct MessageQueue {
    queue: VecDeque<Message>,
    /// Total messages ever posted
    posted: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a message to the back of the queue
    pub fn post(&mut self, msg: Message) {
        self.posted += 1;
        self.queue.push_back(msg);
    }

    /// Pop the next message
    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn posted(&self) -> u64 {
        self.posted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let mut queue = MessageQueue::new();

        for key in 0..5 {
            queue.post(Message::FetchTimeout { key });
        }
        assert_eq!(queue.len(), 5);

        for key in 0..5 {
            assert_eq!(queue.pop(), Some(Message::FetchTimeout { key }));
        }
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        assert_eq!(queue.posted(), 5);
    }

    #[test]
    fn test_mixed_messages() {
        let mut queue = MessageQueue::new();

        queue.post(Message::Packet {
            from: 3,
            frame: vec![0, 1],
        });
        queue.post(Message::FlashDone {
            handle: CodeHandle(0x0102),
            requester: 4,
        });

        match queue.pop() {
            Some(Message::Packet { from, frame }) => {
                assert_eq!(from, 3);
                assert_eq!(frame, vec![0, 1]);
            }
            other => panic!("expected Packet, got {:?}", other),
        }
        match queue.pop() {
            Some(Message::FlashDone { handle, requester }) => {
                assert_eq!(handle, CodeHandle(0x0102));
                assert_eq!(requester, 4);
            }
            other => panic!("expected FlashDone, got {:?}", other),
        }
    }
}
