//! In-process validation event bus.
//!
//! The node's validation layer publishes block events here; a single bus
//! thread delivers them to registered listeners in publish order. Because
//! delivery is FIFO and callbacks run in-band via
//! [`ValidationBus::call_in_queue`], a callback observed to have run
//! happens-after every event published before it was enqueued.

use crate::queue::Queue;
use bitcoin::Block;
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::JoinHandle;
use talus_primitives::BlockIndex;

/// Receiver of block events, driven on the bus thread.
pub trait ChainEventListener: Send + Sync {
    /// A block was connected to the active chain.
    fn block_connected(&self, block: &Arc<Block>, index: &Arc<BlockIndex>);

    /// A block was disconnected from the active chain.
    fn block_disconnected(&self, _block: &Arc<Block>, _index: &Arc<BlockIndex>) {}
}

enum BusMessage {
    Connected(Arc<Block>, Arc<BlockIndex>),
    Disconnected(Arc<Block>, Arc<BlockIndex>),
    Call(Box<dyn FnOnce() + Send>),
}

struct BusShared {
    queue: Queue<BusMessage>,
    listeners: RwLock<Vec<Arc<dyn ChainEventListener>>>,
}

/// FIFO dispatcher of validation events to registered listeners.
pub struct ValidationBus {
    shared: Arc<BusShared>,
    thread: Option<JoinHandle<()>>,
}

impl Default for ValidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationBus {
    /// Start the bus thread.
    pub fn new() -> Self {
        let shared = Arc::new(BusShared {
            queue: Queue::new(),
            listeners: RwLock::new(Vec::new()),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("validation-bus".into())
                .spawn(move || Self::run(&shared))
                .expect("failed to spawn the validation bus thread")
        };

        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: &BusShared) {
        while let Some(message) = shared.queue.pop() {
            match message {
                BusMessage::Connected(block, index) => {
                    for listener in shared.listeners.read().iter() {
                        listener.block_connected(&block, &index);
                    }
                }
                BusMessage::Disconnected(block, index) => {
                    for listener in shared.listeners.read().iter() {
                        listener.block_disconnected(&block, &index);
                    }
                }
                BusMessage::Call(f) => f(),
            }
        }
    }

    /// Register a listener for subsequent events.
    pub fn register(&self, listener: Arc<dyn ChainEventListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Publish a block-connected event. Must be called in connect order.
    pub fn block_connected(&self, block: Arc<Block>, index: Arc<BlockIndex>) {
        self.shared.queue.push(BusMessage::Connected(block, index));
    }

    /// Publish a block-disconnected event. Must be called in disconnect
    /// order.
    pub fn block_disconnected(&self, block: Arc<Block>, index: Arc<BlockIndex>) {
        self.shared.queue.push(BusMessage::Disconnected(block, index));
    }

    /// Enqueue a callback behind all currently queued events.
    pub fn call_in_queue(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.queue.push(BusMessage::Call(Box::new(f)));
    }

    /// Stop delivering events and wake the bus thread.
    pub fn interrupt(&self) {
        self.shared.queue.interrupt();
    }
}

impl Drop for ValidationBus {
    fn drop(&mut self) {
        self.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
