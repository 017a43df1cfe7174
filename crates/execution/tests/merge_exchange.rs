use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_common::ids::{PlanNodeId, QueryId, RemoteTaskId, TaskId};
use arbor_common::{QueryConfig, Result};
use arbor_execution::{
    encode_page, CompareFlags, Driver, DriverCtx, ExchangeClient, ExchangeSerdeKind, KeyChannel,
    MergeOperator, Operator, OperatorCtx, QueryCtx, SortKey, Split, Task,
    SHUFFLE_COMPRESSION_KIND, SHUFFLE_SERDE_KIND,
};
use arbor_memory::{MemoryManager, MemoryManagerOptions};
use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};

const MB: u64 = 1 << 20;
const NODE: PlanNodeId = PlanNodeId(3);

/// In-memory exchange: pages are pre-encoded per remote task and handed out
/// in order.
struct TestExchangeClient {
    pages: Mutex<HashMap<RemoteTaskId, VecDeque<Vec<u8>>>>,
}

impl TestExchangeClient {
    fn new(per_task: Vec<(RemoteTaskId, Vec<RecordBatch>)>) -> Arc<Self> {
        let mut pages = HashMap::new();
        for (remote, batches) in per_task {
            let encoded = batches
                .iter()
                .map(|batch| encode_page(std::slice::from_ref(batch)).expect("page"))
                .collect::<VecDeque<_>>();
            pages.insert(remote, encoded);
        }
        Arc::new(Self {
            pages: Mutex::new(pages),
        })
    }
}

impl ExchangeClient for TestExchangeClient {
    fn next_page(&self, remote_task: &RemoteTaskId) -> Result<Option<Vec<u8>>> {
        let mut pages = self.pages.lock().expect("pages");
        Ok(pages.get_mut(remote_task).and_then(VecDeque::pop_front))
    }
}

fn int_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]))
}

fn int_batch(values: &[i64]) -> RecordBatch {
    RecordBatch::try_new(
        int_schema(),
        vec![Arc::new(Int64Array::from(values.to_vec()))],
    )
    .expect("batch")
}

fn int_values(batches: &[RecordBatch]) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|batch| {
            batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("int column")
                .iter()
                .map(|v| v.expect("non-null"))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn test_setup(batch_size_rows: usize) -> (MemoryManager, Arc<QueryCtx>, Arc<Task>) {
    let manager = MemoryManager::new(MemoryManagerOptions {
        total_capacity: 256 * MB,
        pool_init_capacity: 16 * MB,
        allow_abort: false,
    });
    let config = QueryConfig {
        batch_size_rows,
        ..QueryConfig::default()
    };
    let query = QueryCtx::new(QueryId(9), config, &manager).expect("query ctx");
    let task = Task::new(TaskId(1), &query).expect("task");
    (manager, query, task)
}

fn exchange_op(task: &Arc<Task>, driver_id: u32, client: Arc<dyn ExchangeClient>) -> Arc<Mutex<dyn Operator>> {
    let schema = int_schema();
    let keys =
        vec![SortKey::try_new(KeyChannel::Ordinal(0), CompareFlags::default(), &schema).expect("key")];
    let ctx = OperatorCtx {
        operator_id: 0,
        plan_node_id: NODE,
        driver: DriverCtx {
            driver_id,
            pipeline_id: 0,
            task: Arc::clone(task),
        },
    };
    let merge = MergeOperator::exchange(ctx, schema, keys, client, ExchangeSerdeKind::ArrowIpc)
        .expect("merge exchange");
    Arc::new(Mutex::new(merge))
}

fn run_driver(task: &Arc<Task>, driver_id: u32, op: &Arc<Mutex<dyn Operator>>) -> Vec<RecordBatch> {
    let driver = Driver::new(DriverCtx {
        driver_id,
        pipeline_id: 0,
        task: Arc::clone(task),
    });
    driver.run(op).expect("driver run")
}

#[test]
fn merges_pages_from_remote_tasks_discovered_by_splits() {
    let (_manager, _query, task) = test_setup(4);
    let t1 = RemoteTaskId::new("q9.0.1@w1");
    let t2 = RemoteTaskId::new("q9.0.2@w2");
    let client = TestExchangeClient::new(vec![
        (t1.clone(), vec![int_batch(&[1, 4]), int_batch(&[7])]),
        (t2.clone(), vec![int_batch(&[2, 5, 8])]),
    ]);

    task.add_split(NODE, Split::remote(t1));
    task.add_split(NODE, Split::remote(t2));
    task.no_more_splits(NODE);

    let op = exchange_op(&task, 0, client);
    let batches = run_driver(&task, 0, &op);

    assert_eq!(int_values(&batches), vec![1, 2, 4, 5, 7, 8]);
    assert_eq!(task.num_consumed_splits(), 2);
}

#[test]
fn blocks_on_splits_until_the_end_marker_arrives() {
    let (_manager, _query, task) = test_setup(1024);
    let t1 = RemoteTaskId::new("late.1");
    let client = TestExchangeClient::new(vec![(t1.clone(), vec![int_batch(&[10, 11])])]);

    let op = exchange_op(&task, 0, client);
    let driver_task = Arc::clone(&task);
    let driver = std::thread::spawn(move || run_driver(&driver_task, 0, &op));

    std::thread::sleep(Duration::from_millis(30));
    task.add_split(NODE, Split::remote(t1));
    std::thread::sleep(Duration::from_millis(10));
    task.no_more_splits(NODE);

    let batches = driver.join().expect("driver thread");
    assert_eq!(int_values(&batches), vec![10, 11]);
}

#[test]
fn non_zero_driver_finishes_without_merging() {
    let (_manager, _query, task) = test_setup(1024);
    let client = TestExchangeClient::new(vec![]);
    // No splits delivered; driver 1 must not wait for them.
    let op = exchange_op(&task, 1, client);
    let batches = run_driver(&task, 1, &op);
    assert!(batches.is_empty());
}

#[test]
fn close_records_serde_and_compression_stats() {
    let (_manager, _query, task) = test_setup(1024);
    let t1 = RemoteTaskId::new("stats.1");
    let client = TestExchangeClient::new(vec![(t1.clone(), vec![int_batch(&[1])])]);
    task.add_split(NODE, Split::remote(t1));
    task.no_more_splits(NODE);

    let op = exchange_op(&task, 0, client);
    let batches = run_driver(&task, 0, &op);
    assert_eq!(int_values(&batches), vec![1]);

    let stats = op.lock().expect("operator").stats();
    assert_eq!(stats.rows_out, 1);
    assert_eq!(stats.batches_out, 1);
    let serde = stats.runtime_stats[SHUFFLE_SERDE_KIND];
    assert_eq!(serde.sum, ExchangeSerdeKind::ArrowIpc.code());
    assert_eq!(serde.count, 1);
    assert!(stats.runtime_stats.contains_key(SHUFFLE_COMPRESSION_KIND));
}

#[test]
fn single_remote_task_is_a_passthrough() {
    let (_manager, _query, task) = test_setup(2);
    let t1 = RemoteTaskId::new("solo.1");
    let client = TestExchangeClient::new(vec![(
        t1.clone(),
        vec![int_batch(&[10, 20, 30]), int_batch(&[40])],
    )]);
    task.add_split(NODE, Split::remote(t1));
    task.no_more_splits(NODE);

    let op = exchange_op(&task, 0, client);
    let batches = run_driver(&task, 0, &op);

    // Passthrough keeps the remote batch boundaries even though the output
    // batch size is smaller.
    assert_eq!(batches.len(), 2);
    assert_eq!(int_values(&batches), vec![10, 20, 30, 40]);
}

#[test]
fn no_splits_at_all_finishes_empty() {
    let (_manager, _query, task) = test_setup(1024);
    let client = TestExchangeClient::new(vec![]);
    task.no_more_splits(NODE);

    let op = exchange_op(&task, 0, client);
    let batches = run_driver(&task, 0, &op);
    assert!(batches.is_empty());
}
