use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, Mutex};

use crate::models::{ScanJob, ScanResult};
use crate::probes::ProbeCatalogue;
use crate::techniques;

/// Upper bound on jobs buffered ahead of the workers
const JOB_QUEUE_CAPACITY: usize = 1000;

/// The interchangeable probing strategies the orchestrator can drive.
/// Selection happens at task-admission time; constructors that can fail
/// (SYN/UDP init) run before a scan is ever started.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    Connect,
    Syn,
    Udp,
}

impl WorkerKind {
    async fn run(self, job: ScanJob, catalogue: &ProbeCatalogue) -> ScanResult {
        match self {
            WorkerKind::Connect => techniques::connect_probe(&job.host, job.port, catalogue).await,
            WorkerKind::Syn => techniques::syn_probe(&job.host, job.port).await,
            WorkerKind::Udp => techniques::udp_probe(&job.host, job.port).await,
        }
    }
}

/// Fan `(host, port)` jobs out to a pool of concurrent workers and collect
/// their results.
///
/// A producer task enqueues every pair in row-major order (hosts outer,
/// ports ascending) through a bounded channel and closes it; each worker
/// drains jobs until the channel is empty, then drops its result sender,
/// which is its completion signal. Results carry no ordering guarantee.
///
/// Probe failures are encoded as result states, so the orchestrator itself
/// cannot fail.
pub async fn execute_scan(
    hosts: &[String],
    start_port: u16,
    end_port: u16,
    worker: WorkerKind,
    worker_count: usize,
    catalogue: Arc<ProbeCatalogue>,
) -> Vec<ScanResult> {
    let total = hosts.len() * (end_port as usize - start_port as usize + 1);
    if total == 0 {
        return Vec::new();
    }

    let (job_tx, job_rx) = mpsc::channel::<ScanJob>(JOB_QUEUE_CAPACITY);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<ScanResult>(total);

    debug!(
        "starting {:?} scan: {} hosts, ports {}-{}, {} workers",
        worker,
        hosts.len(),
        start_port,
        end_port,
        worker_count
    );

    for _ in 0..worker_count {
        let jobs = Arc::clone(&job_rx);
        let results = result_tx.clone();
        let catalogue = Arc::clone(&catalogue);
        tokio::spawn(async move {
            loop {
                let job = { jobs.lock().await.recv().await };
                let Some(job) = job else { break };
                let outcome = worker.run(job, &catalogue).await;
                if results.send(outcome).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let producer_hosts: Vec<String> = hosts.to_vec();
    tokio::spawn(async move {
        for host in producer_hosts {
            for port in start_port..=end_port {
                let job = ScanJob { host: host.clone(), port };
                if job_tx.send(job).await.is_err() {
                    return;
                }
            }
        }
        // job_tx drops here, closing the channel behind the last job
    });

    let mut results = Vec::with_capacity(total);
    while let Some(outcome) = result_rx.recv().await {
        results.push(outcome);
    }
    debug!("scan finished with {} results for {} jobs", results.len(), total);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanState;
    use tokio::net::TcpListener;

    /// Reserve a loopback port with no listener behind it
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn every_job_produces_exactly_one_result() {
        let base = free_port().await;
        let hosts = vec!["127.0.0.1".to_string(), "127.0.0.1".to_string()];
        let catalogue = Arc::new(ProbeCatalogue::empty());

        let results = execute_scan(
            &hosts,
            base,
            base.saturating_add(2),
            WorkerKind::Connect,
            8,
            catalogue,
        )
        .await;

        assert_eq!(results.len(), 6);
        for outcome in &results {
            assert_eq!(outcome.host, "127.0.0.1");
            assert!((base..=base.saturating_add(2)).contains(&outcome.port));
            if outcome.state != ScanState::Open {
                assert!(outcome.service.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn more_workers_than_jobs_is_fine() {
        let port = free_port().await;
        let hosts = vec!["127.0.0.1".to_string()];
        let catalogue = Arc::new(ProbeCatalogue::empty());

        let results = execute_scan(&hosts, port, port, WorkerKind::Connect, 100, catalogue).await;
        assert_eq!(results.len(), 1);
    }
}
