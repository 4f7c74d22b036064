use crate::noso::{
    error::MinerError,
    hasher::{Hasher, Targets, HASH_CHARS},
    types::{Event, HashRateReport, Job, JobStream, JobStreamRequest, Solution},
    Cycle, CycleService,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;

/// Default number of leading suffix characters searched per job.
pub const DEFAULT_LEADING_CHARS: usize = 5;

const OUTPUT_BUFFER: usize = 256;

#[derive(Debug)]
enum WorkerOutput {
    Solution(Solution),
    Report(HashRateReport),
}

/// Runs `workers` blocking search threads per connection cycle.
pub struct MinerPool {
    workers: usize,
    leading_chars: usize,
}

impl MinerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            leading_chars: DEFAULT_LEADING_CHARS,
        }
    }

    /// Bounds each job to `HASH_CHARS[..n]` in the leading suffix position.
    pub fn with_leading_chars(mut self, n: usize) -> Self {
        self.leading_chars = n.clamp(1, HASH_CHARS.len());
        self
    }
}

#[async_trait]
impl CycleService for MinerPool {
    async fn start(&self, cycle: &Cycle) -> Result<(), MinerError> {
        if self.workers == 0 {
            return Err(MinerError::Config("at least one worker is required".into()));
        }

        let (output, rx) = mpsc::channel(OUTPUT_BUFFER);
        cycle.tracker.spawn(relay(rx, cycle.clone()));

        for id in 0..self.workers {
            let worker = Worker {
                id,
                leading_chars: self.leading_chars,
                output: output.clone(),
            };
            let cycle = cycle.clone();
            let tracker = cycle.tracker.clone();
            tracker.spawn(async move {
                let Some(stream) = request_job_stream(&cycle).await else {
                    return;
                };
                log::debug!(target: "miner", "Worker {} has its job stream", id);
                cycle.tracker.spawn_blocking(move || worker.run(stream));
            });
        }

        Ok(())
    }
}

async fn request_job_stream(cycle: &Cycle) -> Option<JobStream> {
    let (reply, mut rx) = mpsc::channel(1);
    cycle
        .broker
        .publish(Event::JobStreamRequest(JobStreamRequest { reply }))
        .await;

    tokio::select! {
        biased;
        _ = cycle.cancel.cancelled() => None,
        stream = rx.recv() => {
            if stream.is_none() {
                log::error!(target: "miner", "Job stream request went unanswered");
            }
            stream
        }
    }
}

/// Publishes worker output on the broker and keeps the total hash rate.
async fn relay(mut rx: mpsc::Receiver<WorkerOutput>, cycle: Cycle) {
    let mut rates: HashMap<usize, u64> = HashMap::new();

    loop {
        let output = tokio::select! {
            biased;
            _ = cycle.cancel.cancelled() => break,
            output = rx.recv() => match output {
                Some(output) => output,
                None => break,
            },
        };

        match output {
            WorkerOutput::Solution(solution) => {
                cycle.broker.publish(Event::Solution(solution)).await;
            }
            WorkerOutput::Report(report) => {
                rates.insert(report.worker, report.hash_rate());
                cycle.set_hash_rate(rates.values().sum());
                cycle.broker.publish(Event::HashRate(report)).await;
            }
        }
    }
}

struct Worker {
    id: usize,
    leading_chars: usize,
    output: mpsc::Sender<WorkerOutput>,
}

impl Worker {
    /// Pulls jobs until the stream or the output channel closes.
    fn run(self, stream: JobStream) {
        while let Ok(job) = stream.recv() {
            if job.is_cancelled() {
                continue;
            }

            let targets = match Targets::new(&job.target_string, job.difficulty, job.pool_depth) {
                Ok(targets) => targets,
                Err(err) => {
                    log::warn!(target: "miner", "Worker {} skipping job: {}", self.id, err);
                    continue;
                }
            };

            let started = Instant::now();
            let Some(hashes) = self.search(&job, &targets) else {
                break;
            };

            let report = HashRateReport {
                worker: self.id,
                hashes,
                elapsed: started.elapsed(),
            };
            if self.output.blocking_send(WorkerOutput::Report(report)).is_err() {
                break;
            }
        }
        log::debug!(target: "miner", "Worker {} stopped", self.id);
    }

    /// Hashes every suffix of the job, returning the hash count, or `None`
    /// once nobody is listening for solutions.
    fn search(&self, job: &Job, targets: &Targets) -> Option<u64> {
        let mut hasher = Hasher::new(&job.miner_seed);
        let mut suffix = [0u8; 4];
        let mut hashes = 0u64;

        for &a in &HASH_CHARS[..self.leading_chars] {
            suffix[0] = a;
            for &b in HASH_CHARS {
                if job.is_cancelled() {
                    return Some(hashes);
                }
                suffix[1] = b;
                for &c in HASH_CHARS {
                    suffix[2] = c;
                    for &d in HASH_CHARS {
                        suffix[3] = d;
                        hashes += 1;

                        let Some(target_len) = targets.best_match(hasher.hash(&suffix)) else {
                            continue;
                        };
                        let solution = Solution {
                            block: job.block,
                            seed: job.miner_seed_base.clone(),
                            hash_str: format!(
                                "{}{}",
                                job.miner_postfix,
                                suffix.iter().map(|&ch| ch as char).collect::<String>()
                            ),
                            target_len,
                            target_chars: job.target_chars,
                        };
                        log::debug!(
                            target: "miner",
                            "Worker {} found {} for block {}",
                            self.id,
                            hasher.hex(),
                            job.block
                        );
                        if self.output.blocking_send(WorkerOutput::Solution(solution)).is_err() {
                            return None;
                        }
                    }
                }
            }
        }

        Some(hashes)
    }
}
