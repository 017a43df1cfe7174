//! Blocking futures exchanged between operators and the driver.
//!
//! An operator that cannot make progress hands the driver a
//! [`ContinueFuture`]; whoever unblocks it (a producer, the task, the
//! arbitrator) holds the matching [`ContinuePromise`]. Dropping a promise
//! wakes the waiter too, so teardown never strands a driver.

use futures::channel::oneshot;

/// Completion side of a blocking edge.
#[derive(Debug)]
pub struct ContinuePromise {
    tx: Option<oneshot::Sender<()>>,
}

impl ContinuePromise {
    /// Wake the waiting driver.
    pub fn fulfill(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Waiting side of a blocking edge. The driver blocks on it; operators never
/// poll.
#[derive(Debug)]
pub struct ContinueFuture {
    rx: oneshot::Receiver<()>,
}

impl ContinueFuture {
    /// Block the calling thread until the promise is fulfilled or dropped.
    pub fn wait(self) {
        // A dropped promise reads as cancellation; both mean "re-enter the
        // operator and look again".
        let _ = futures::executor::block_on(self.rx);
    }
}

/// Create a connected promise/future pair.
pub fn continue_pair() -> (ContinuePromise, ContinueFuture) {
    let (tx, rx) = oneshot::channel();
    (ContinuePromise { tx: Some(tx) }, ContinueFuture { rx })
}
