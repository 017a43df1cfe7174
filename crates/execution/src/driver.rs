//! Cooperative driver loop.
//!
//! One driver advances one pipeline: `is_blocked` → wait → `get_output`,
//! yielding to the scheduler whenever the operator hands back a future. All
//! waits happen inside suspended sections so the arbitrator can pause the
//! task without deadlock.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use arbor_common::Result;
use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::operator::Operator;
use crate::task::Task;

/// Identity of one driver slot within a task.
#[derive(Clone)]
pub struct DriverCtx {
    /// Driver index within the pipeline; merge shapes care about 0.
    pub driver_id: u32,
    /// Pipeline index within the task.
    pub pipeline_id: u32,
    /// The owning task.
    pub task: Arc<Task>,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

struct SuspendGuard {
    task: Arc<Task>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.task.suspend_leave();
    }
}

/// Run `f` inside a suspended section of the current driver's task.
///
/// Any work that can block or enter memory arbitration from a driver thread
/// must run through here, so a pause request never waits on this driver.
/// Outside a driver thread this is a plain call.
pub fn with_suspended_section<T>(f: impl FnOnce() -> T) -> T {
    let task = CURRENT_TASK.with(|current| current.borrow().clone());
    match task {
        Some(task) => {
            task.suspend_enter();
            let _guard = SuspendGuard { task };
            f()
        }
        None => f(),
    }
}

/// A host-scheduled unit that repeatedly advances one pipeline of operators.
pub struct Driver {
    ctx: DriverCtx,
}

impl Driver {
    /// Create a driver for one slot.
    pub fn new(ctx: DriverCtx) -> Self {
        Self { ctx }
    }

    /// This driver's context.
    pub fn ctx(&self) -> &DriverCtx {
        &self.ctx
    }

    /// Drive a source operator to completion, collecting its output.
    ///
    /// Returns the task's terminal error if the task aborts mid-run. The
    /// operator is closed on every exit path.
    pub fn run(&self, operator: &Arc<Mutex<dyn Operator>>) -> Result<Vec<RecordBatch>> {
        let task = Arc::clone(&self.ctx.task);
        task.driver_entered();
        CURRENT_TASK.with(|current| *current.borrow_mut() = Some(Arc::clone(&task)));

        let result = self.run_loop(operator);

        CURRENT_TASK.with(|current| *current.borrow_mut() = None);
        task.driver_exited();
        if result.is_err() {
            let _ = operator.lock().expect("operator").close();
        }
        result
    }

    fn run_loop(&self, operator: &Arc<Mutex<dyn Operator>>) -> Result<Vec<RecordBatch>> {
        let task = &self.ctx.task;
        let mut out = Vec::new();
        loop {
            if let Some(err) = task.terminal_error() {
                debug!(driver = self.ctx.driver_id, error = %err, "driver observed task termination");
                return Err(err);
            }
            task.yield_if_paused();

            let blocked = operator.lock().expect("operator").is_blocked()?;
            if let Some(blocked) = blocked {
                with_suspended_section(|| blocked.future.wait());
                continue;
            }

            let mut op = operator.lock().expect("operator");
            if op.is_finished() {
                op.close()?;
                return Ok(out);
            }
            if let Some(batch) = op.get_output()? {
                out.push(batch);
            }
        }
    }
}
