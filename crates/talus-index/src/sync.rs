//! Per-index synchronization: catch-up, steady state and drain barriers.

use crate::bus::{ChainEventListener, ValidationBus};
use crate::queue::Queue;
use crate::{BlockFilterIndex, Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use talus_chain_mmr::Chain;
use talus_primitives::{BlockIndex, BlockSource, CoinView};
use talus_utxo_mmr::UtxoMmr;

/// An index that can be driven block by block.
///
/// `write_block` must be idempotent for the block currently recorded as
/// best: catch-up and queued delivery may overlap by one block.
pub trait IndexWriter: Send + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Hash of the last block applied, or the zero hash for a fresh index.
    fn best_block(&self) -> Result<BlockHash>;

    /// Apply a newly connected block.
    fn write_block(&mut self, block: &Block, index: &BlockIndex) -> Result<()>;

    /// Unwind the index from `current_tip` back to its ancestor `new_tip`.
    fn rewind(&mut self, current_tip: &Arc<BlockIndex>, new_tip: &Arc<BlockIndex>) -> Result<()>;
}

impl IndexWriter for BlockFilterIndex {
    fn name(&self) -> &str {
        BlockFilterIndex::name(self)
    }

    fn best_block(&self) -> Result<BlockHash> {
        BlockFilterIndex::best_block(self)
    }

    fn write_block(&mut self, block: &Block, index: &BlockIndex) -> Result<()> {
        BlockFilterIndex::write_block(self, block, index)
    }

    fn rewind(&mut self, current_tip: &Arc<BlockIndex>, new_tip: &Arc<BlockIndex>) -> Result<()> {
        BlockFilterIndex::rewind(self, current_tip, new_tip)
    }
}

/// Adapter driving the UTXO accumulator from block events.
///
/// Reorgs are re-expressed as per-block disconnects: `rewind` walks from
/// the old tip down to the fork, restoring spent coins and rewinding
/// appended outputs for each block.
pub struct UtxoMmrWriter {
    mmr: UtxoMmr,
    source: Arc<dyn BlockSource>,
    view: Arc<dyn CoinView>,
}

impl UtxoMmrWriter {
    /// Wrap an accumulator together with its block and coin sources.
    pub fn new(mmr: UtxoMmr, source: Arc<dyn BlockSource>, view: Arc<dyn CoinView>) -> Self {
        Self { mmr, source, view }
    }

    /// The wrapped accumulator.
    pub fn mmr(&self) -> &UtxoMmr {
        &self.mmr
    }
}

impl IndexWriter for UtxoMmrWriter {
    fn name(&self) -> &str {
        "utxo accumulator"
    }

    fn best_block(&self) -> Result<BlockHash> {
        Ok(self.mmr.best_block()?)
    }

    fn write_block(&mut self, block: &Block, index: &BlockIndex) -> Result<()> {
        // Catch-up and queued delivery may hand over the same block once.
        if self.mmr.best_block()? == block.block_hash() {
            return Ok(());
        }
        let undo = self
            .source
            .undo(&index.hash)
            .ok_or(Error::UndoNotFound(index.hash))?;
        self.mmr
            .block_connected(block, &undo, &*self.view, index)?;
        Ok(())
    }

    fn rewind(&mut self, current_tip: &Arc<BlockIndex>, new_tip: &Arc<BlockIndex>) -> Result<()> {
        let mut walk = current_tip.clone();
        while walk.hash != new_tip.hash {
            let block = self
                .source
                .block(&walk.hash)
                .ok_or(Error::BlockNotFound(walk.hash))?;
            let undo = self
                .source
                .undo(&walk.hash)
                .ok_or(Error::UndoNotFound(walk.hash))?;
            self.mmr.block_disconnected(&block, &undo)?;

            walk = walk
                .prev
                .clone()
                .ok_or(Error::BlockNotFound(new_tip.hash))?;
        }
        Ok(())
    }
}

/// A connected block queued for the synchronizer thread.
pub struct BlockUpdate {
    /// The block body.
    pub block: Arc<Block>,
    /// Its chain entry.
    pub index: Arc<BlockIndex>,
}

struct SyncShared<W> {
    writer: Mutex<W>,
    name: String,
    chain: Arc<RwLock<Chain>>,
    source: Arc<dyn BlockSource>,
    synced: AtomicBool,
    failed: AtomicBool,
    interrupt: AtomicBool,
    best_block: RwLock<Option<Arc<BlockIndex>>>,
    queue: Queue<BlockUpdate>,
}

impl<W: IndexWriter> ChainEventListener for SyncShared<W> {
    fn block_connected(&self, block: &Arc<Block>, index: &Arc<BlockIndex>) {
        // Events arriving during initial sync are dropped; the catch-up
        // loop reaches their blocks through the chain instead.
        if !self.synced.load(Ordering::SeqCst) {
            return;
        }
        self.queue.push(BlockUpdate {
            block: block.clone(),
            index: index.clone(),
        });
    }
}

/// Background synchronizer keeping one index in step with the chain.
///
/// Owns the worker thread; dropping interrupts it and joins.
pub struct IndexSynchronizer<W: IndexWriter> {
    shared: Arc<SyncShared<W>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<W: IndexWriter> IndexSynchronizer<W> {
    /// Resolve the writer's starting point and start the worker thread.
    ///
    /// Register the returned synchronizer's [`listener`](Self::listener)
    /// on the validation bus to feed it steady-state events.
    pub fn start(
        writer: W,
        chain: Arc<RwLock<Chain>>,
        source: Arc<dyn BlockSource>,
    ) -> Result<Arc<Self>> {
        let name = writer.name().to_string();

        let best_block_hash = writer.best_block()?;
        let best_block = if best_block_hash == BlockHash::all_zeros() {
            None
        } else {
            Some(
                source
                    .block_index(&best_block_hash)
                    .ok_or(Error::UnknownBestBlock(best_block_hash))?,
            )
        };

        let synced = {
            let chain = chain.read();
            match (&best_block, chain.tip()) {
                // An empty chain leaves nothing to sync.
                (_, None) => true,
                (Some(best), Some(tip)) => best
                    .ancestor_at(tip.height)
                    .is_some_and(|ancestor| ancestor.hash == tip.hash),
                (None, Some(_)) => false,
            }
        };

        let shared = Arc::new(SyncShared {
            writer: Mutex::new(writer),
            name,
            chain,
            source,
            synced: AtomicBool::new(synced),
            failed: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            best_block: RwLock::new(best_block),
            queue: Queue::new(),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(shared.name.clone())
                .spawn(move || Self::run(&shared))
                .expect("failed to spawn the index sync thread")
        };

        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// The listener to register on the validation bus.
    pub fn listener(self: &Arc<Self>) -> Arc<dyn ChainEventListener> {
        self.shared.clone()
    }

    /// Whether the synchronizer shut down on a fatal error.
    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Run the writer under the lock.
    pub fn with_writer<R>(&self, f: impl FnOnce(&W) -> R) -> R {
        f(&self.shared.writer.lock())
    }

    fn run(shared: &Arc<SyncShared<W>>) {
        if let Err(error) = Self::thread_sync(shared) {
            tracing::error!(%error, "Failed to sync {}; the index is shutting down", shared.name);
            shared.failed.store(true, Ordering::SeqCst);
            // Resolve pending drain barriers so waiters observe the failure.
            shared.queue.interrupt();
        }
    }

    /// Block after `prev` on the active chain, hopping to the fork branch
    /// when `prev` has been reorganized out.
    fn next_sync_block(chain: &Chain, prev: Option<&Arc<BlockIndex>>) -> Option<Arc<BlockIndex>> {
        let Some(prev) = prev else {
            return chain.genesis();
        };
        if let Some(next) = chain.next(prev) {
            return Some(next);
        }
        chain.find_fork(prev).and_then(|fork| chain.next(&fork))
    }

    fn thread_sync(shared: &Arc<SyncShared<W>>) -> Result<()> {
        let mut best = shared.best_block.read().clone();

        if !shared.synced.load(Ordering::SeqCst) {
            tracing::info!(
                from_height = best.as_ref().map(|b| b.height + 1).unwrap_or(0),
                "Syncing {} with the block chain",
                shared.name
            );

            loop {
                if shared.interrupt.load(Ordering::SeqCst) {
                    return Ok(());
                }

                let next = {
                    let chain = shared.chain.read();
                    match Self::next_sync_block(&chain, best.as_ref()) {
                        Some(next) => next,
                        None => {
                            *shared.best_block.write() = best.clone();
                            shared.synced.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                };

                // When our best block left the active chain, unwind the
                // writer to the branch point before advancing.
                if let Some(current) = &best {
                    if next.prev_block_hash() != current.hash {
                        let new_tip = next
                            .prev
                            .clone()
                            .expect("a non-genesis block has a parent");
                        shared.writer.lock().rewind(current, &new_tip)?;
                        best = Some(new_tip);
                        *shared.best_block.write() = best.clone();
                    }
                }

                let block = shared
                    .source
                    .block(&next.hash)
                    .ok_or(Error::BlockNotFound(next.hash))?;
                shared.writer.lock().write_block(&block, &next)?;

                best = Some(next);
                *shared.best_block.write() = best.clone();
            }

            tracing::info!(
                height = best.as_ref().map(|b| b.height),
                "{} is enabled",
                shared.name
            );
        }

        // Steady state: apply queued updates until interrupted.
        while !shared.interrupt.load(Ordering::SeqCst) {
            let Some(update) = shared.queue.pop() else {
                return Ok(());
            };
            let index = update.index;

            // The queued block must connect to an ancestor of our best
            // block; anything else means we lost an event.
            let best = shared.best_block.read().clone();
            let connects = match (&best, &index.prev) {
                (Some(best), Some(prev)) => best
                    .ancestor_at(prev.height)
                    .is_some_and(|ancestor| ancestor.hash == prev.hash),
                (None, None) => true,
                _ => false,
            };
            if !connects {
                return Err(Error::OutOfOrderBlock {
                    got: index.hash,
                    tip: best
                        .map(|b| b.hash)
                        .unwrap_or_else(BlockHash::all_zeros),
                });
            }

            shared.writer.lock().write_block(&update.block, &index)?;
            *shared.best_block.write() = Some(index);
        }

        Ok(())
    }

    /// Block until the index has processed every event delivered before
    /// this call.
    ///
    /// Fast path: if the index is already at the chain tip, return
    /// immediately. Otherwise drain the validation bus (proving every
    /// connect published so far has been handed to us), then drain our own
    /// queue. Returns `false` if the index never finished its initial sync
    /// or was interrupted.
    pub fn block_until_synced_to_current_chain(&self, bus: &ValidationBus) -> bool {
        if !self.shared.synced.load(Ordering::SeqCst) {
            return false;
        }

        {
            let chain = self.shared.chain.read();
            if let (Some(best), Some(tip)) =
                (self.shared.best_block.read().clone(), chain.tip())
            {
                if best
                    .ancestor_at(tip.height)
                    .is_some_and(|ancestor| ancestor.hash == tip.hash)
                {
                    return true;
                }
            }
        }

        let (sender, receiver) = std::sync::mpsc::channel();
        bus.call_in_queue(move || {
            let _ = sender.send(());
        });
        if receiver.recv().is_err() {
            return false;
        }

        self.shared.queue.wait_until_processed().wait()
    }

    /// Interrupt the worker thread.
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::SeqCst);
        self.shared.queue.interrupt();
    }

    /// Interrupt and join the worker thread.
    pub fn stop(&self) {
        self.interrupt();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl<W: IndexWriter> Drop for IndexSynchronizer<W> {
    fn drop(&mut self) {
        self.stop();
    }
}
