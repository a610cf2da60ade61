use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use cortex::models::{ScanMode, ScanState, ScanTask, TaskStatus};
use cortex::probes::ProbeCatalogue;
use cortex::tasks::{enqueue_task, start_workers, MemoryStore, ScanModes, TaskStore};

fn start_driver(store: &Arc<MemoryStore>) {
    start_workers(
        Arc::clone(store) as Arc<dyn TaskStore>,
        Arc::new(ProbeCatalogue::empty()),
        Arc::new(ScanModes::new()),
        2,
    );
}

async fn wait_for_terminal(store: &MemoryStore, id: Uuid) -> ScanTask {
    timeout(Duration::from_secs(15), async {
        loop {
            let task = store.get_task(id).await.unwrap();
            if task.is_terminal() {
                return task;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("task did not reach a terminal state in time")
}

/// Reserve a loopback port that has no listener behind it
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn invalid_port_range_fails_the_task() {
    let store = Arc::new(MemoryStore::new());
    start_driver(&store);

    let task = ScanTask::new(vec!["127.0.0.1".to_string()], "abc-20", ScanMode::Connect);
    enqueue_task(store.as_ref(), &task).await.unwrap();

    let done = wait_for_terminal(&store, task.id).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(!done.error.is_empty());
    assert!(done.results.is_empty());
    assert!(done.completed_at.is_some());
    assert_eq!(done.id, task.id);
    assert_eq!(done.created_at, task.created_at);
}

#[tokio::test]
async fn inverted_port_range_fails_with_the_parse_message() {
    let store = Arc::new(MemoryStore::new());
    start_driver(&store);

    let task = ScanTask::new(vec!["127.0.0.1".to_string()], "90-80", ScanMode::Connect);
    enqueue_task(store.as_ref(), &task).await.unwrap();

    let done = wait_for_terminal(&store, task.id).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done.error.contains("greater than"));
}

#[tokio::test]
async fn completed_task_has_one_result_per_job() {
    let store = Arc::new(MemoryStore::new());
    start_driver(&store);

    let base = free_port().await;
    let end = base.saturating_add(2);
    let hosts = vec!["127.0.0.1".to_string(), "127.0.0.1".to_string()];
    let task = ScanTask::new(hosts.clone(), format!("{}-{}", base, end), ScanMode::Connect);
    enqueue_task(store.as_ref(), &task).await.unwrap();

    let done = wait_for_terminal(&store, task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.error.is_empty());
    assert!(done.completed_at.is_some());

    let per_host = (end - base + 1) as usize;
    assert_eq!(done.results.len(), hosts.len() * per_host);
    for result in &done.results {
        assert!(matches!(
            result.state,
            ScanState::Open | ScanState::Closed | ScanState::Filtered
        ));
        if result.state != ScanState::Open {
            assert!(result.service.is_empty());
        }
    }
}

#[tokio::test]
async fn completed_task_survives_a_store_round_trip() {
    let store = Arc::new(MemoryStore::new());
    start_driver(&store);

    let port = free_port().await;
    let task = ScanTask::new(
        vec!["127.0.0.1".to_string()],
        format!("{}-{}", port, port),
        ScanMode::Connect,
    );
    enqueue_task(store.as_ref(), &task).await.unwrap();
    let done = wait_for_terminal(&store, task.id).await;

    let encoded = serde_json::to_string(&done).unwrap();
    let decoded: ScanTask = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, done);
}

#[tokio::test]
async fn vanished_task_is_skipped_and_the_loop_keeps_going() {
    let store = Arc::new(MemoryStore::new());
    start_driver(&store);

    // an id that was queued but never stored
    store.push_to_queue(Uuid::new_v4()).await.unwrap();

    let port = free_port().await;
    let task = ScanTask::new(
        vec!["127.0.0.1".to_string()],
        format!("{}-{}", port, port),
        ScanMode::Connect,
    );
    enqueue_task(store.as_ref(), &task).await.unwrap();

    let done = wait_for_terminal(&store, task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.results.len(), 1);
}

#[tokio::test]
async fn udp_task_runs_through_the_driver() {
    let store = Arc::new(MemoryStore::new());
    start_driver(&store);

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    let task = ScanTask::new(
        vec!["127.0.0.1".to_string()],
        format!("{}-{}", port, port),
        ScanMode::Udp,
    );
    enqueue_task(store.as_ref(), &task).await.unwrap();

    let done = wait_for_terminal(&store, task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.results.len(), 1);
    assert_eq!(done.results[0].state, ScanState::OpenFiltered);
    drop(socket);
}
