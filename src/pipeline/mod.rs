//! Batch runner: fans keys out over a bounded worker pool.
//!
//! ## Rounds
//!
//! Round 0 submits every unique key with `max_workers` permits. Keys still
//! failing afterwards are re-submitted in later rounds with a decaying worker
//! count (never below `min_workers`) after a random pause, until all succeed
//! or `max_rounds` is spent. Permanent failures (unknown symbol, rejected
//! request, unusable history) are never re-submitted. Workers only return
//! values; the coordinating task owns the [`BatchResult`].

use crate::config::BatchConfig;
use crate::models::BatchResult;
use crate::utils::random_delay;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One kind of keyed fetch the runner can drive.
#[async_trait]
pub trait BatchTask: Send + Sync + 'static {
    type Key: Clone + Ord + Hash + fmt::Display + Send + Sync + 'static;
    type Output: Send + 'static;
    type Error: TaskFailure + Send + 'static;

    async fn execute(&self, key: &Self::Key) -> Result<Self::Output, Self::Error>;
}

pub trait TaskFailure: fmt::Display {
    /// `failed to fetch <KEY>: <root cause>`, as written to the failure log.
    fn report(&self) -> String;

    /// Another round would fail the same way.
    fn is_permanent(&self) -> bool;
}

pub struct BatchRunner<J: BatchTask> {
    task: Arc<J>,
    config: BatchConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub symbols: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rounds: u32,
}

impl<J: BatchTask> BatchRunner<J> {
    pub fn new(task: Arc<J>, config: BatchConfig) -> Self {
        Self { task, config }
    }

    /// Worker permits for `round` (0-based).
    pub fn workers_for_round(&self, round: u32) -> usize {
        let max = self.config.max_workers.max(1);
        let floor = self.config.min_workers.clamp(1, max);
        let decay = self.config.decay_rate.clamp(0.0, 1.0);
        let factor = (1.0 - decay).powi(round.min(i32::MAX as u32) as i32);
        ((max as f64 * factor) as usize).clamp(floor, max)
    }

    /// Fetch every key, handing each output to `on_output` on the
    /// coordinating task. An `Err` from `on_output` marks the key failed.
    pub async fn run<T, F>(&self, keys: &[J::Key], mut on_output: F) -> (BatchResult<T, J::Key>, BatchStats)
    where
        F: FnMut(J::Output) -> anyhow::Result<T>,
    {
        let mut seen = HashSet::new();
        let mut remaining: Vec<J::Key> = keys
            .iter()
            .filter(|k| seen.insert((*k).clone()))
            .cloned()
            .collect();

        let mut result = BatchResult::default();
        let mut permanent = HashSet::new();
        let rounds = self.config.max_rounds.max(1);
        let mut rounds_run = 0;

        for round in 0..rounds {
            if remaining.is_empty() {
                break;
            }
            if round > 0 {
                let pause = random_delay(
                    Duration::from_secs(self.config.round_delay_min_secs),
                    Duration::from_secs(self.config.round_delay_max_secs),
                );
                info!("🔁 Retrying {} failed items", remaining.len());
                pause.await;
            }

            let workers = self.workers_for_round(round);
            info!(
                "=== Round {}: {} pending, {} workers ===",
                round + 1,
                remaining.len(),
                workers
            );
            self.run_round(&remaining, workers, &mut result, &mut permanent, &mut on_output)
                .await;
            rounds_run = round + 1;

            remaining = result
                .failed_keys()
                .into_iter()
                .filter(|k| !permanent.contains(k))
                .collect();
            info!(
                "Round {} done: {} ok, {} failing, {} not retried",
                round + 1,
                result.succeeded().len(),
                remaining.len(),
                permanent.len()
            );
        }

        for (key, msg) in result.failed() {
            warn!("{}: {}", key, msg);
        }

        let stats = BatchStats {
            symbols: result.len(),
            succeeded: result.succeeded().len(),
            failed: result.failed().len(),
            rounds: rounds_run,
        };
        (result, stats)
    }

    async fn run_round<T, F>(
        &self,
        keys: &[J::Key],
        workers: usize,
        result: &mut BatchResult<T, J::Key>,
        permanent: &mut HashSet<J::Key>,
        on_output: &mut F,
    ) where
        F: FnMut(J::Output) -> anyhow::Result<T>,
    {
        let sem = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_keys = HashMap::new();

        for key in keys {
            let owned = key.clone();
            let task = Arc::clone(&self.task);
            let sem = Arc::clone(&sem);

            let handle = tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let outcome = task.execute(&owned).await;
                (owned, outcome)
            });
            task_keys.insert(handle.id(), key.clone());
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (key, Ok(output)))) => match on_output(output) {
                    Ok(value) => result.record_success(key, value),
                    Err(e) => {
                        let msg = format!("failed to store {}: {}", key, e.root_cause());
                        warn!("{}", msg);
                        result.record_failure(key, msg);
                    }
                },
                Ok((_, (key, Err(e)))) => {
                    let msg = e.report();
                    debug!("{}", e);
                    if e.is_permanent() {
                        warn!("{} (not retried)", msg);
                        permanent.insert(key.clone());
                    } else {
                        warn!("{}", msg);
                    }
                    result.record_failure(key, msg);
                }
                Err(e) => {
                    let key = task_keys.get(&e.id()).cloned();
                    match key {
                        Some(key) => {
                            error!("Task panic for {}: {}", key, e);
                            result.record_failure(key.clone(), format!("failed to fetch {}: {}", key, e));
                        }
                        None => error!("Task panic: {}", e),
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::tests::{fetcher, sample_history, ScriptedProvider};
    use crate::models::Symbol;

    fn config(max_rounds: u32) -> BatchConfig {
        BatchConfig {
            max_workers: 4,
            min_workers: 2,
            decay_rate: 0.2,
            max_rounds,
            round_delay_min_secs: 0,
            round_delay_max_secs: 0,
        }
    }

    fn symbols(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(|n| Symbol::parse(n).unwrap()).collect()
    }

    #[test]
    fn test_worker_schedule_decays_to_floor() {
        let provider = Arc::new(ScriptedProvider::default());
        let runner = BatchRunner::new(
            Arc::new(fetcher(provider, 1)),
            BatchConfig { max_workers: 20, min_workers: 10, ..config(5) },
        );
        assert_eq!(runner.workers_for_round(0), 20);
        assert_eq!(runner.workers_for_round(1), 16);
        assert_eq!(runner.workers_for_round(2), 12);
        assert_eq!(runner.workers_for_round(3), 10);
        assert_eq!(runner.workers_for_round(9), 10);
    }

    #[test]
    fn test_min_workers_never_exceeds_max() {
        let provider = Arc::new(ScriptedProvider::default());
        let runner = BatchRunner::new(
            Arc::new(fetcher(provider, 1)),
            BatchConfig { max_workers: 3, min_workers: 10, ..config(5) },
        );
        assert_eq!(runner.workers_for_round(0), 3);
        assert_eq!(runner.workers_for_round(4), 3);
    }

    #[tokio::test]
    async fn test_partial_failures_are_isolated() {
        let provider = Arc::new(ScriptedProvider {
            always_fail: vec!["BAD1".into(), "BAD2".into()],
            ..Default::default()
        });
        let runner = BatchRunner::new(Arc::new(fetcher(provider, 2)), config(3));
        let input = symbols(&["AAA", "BAD1", "BBB", "CCC", "BAD2", "DDD", "aaa"]);

        let (result, stats) = runner.run(&input, |r| Ok(r)).await;

        assert_eq!(result.len(), 6);
        assert_eq!(stats.symbols, 6);
        assert_eq!(stats.succeeded, 4);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.rounds, 3);
        for (symbol, msg) in result.failed() {
            assert!(symbol.as_str().starts_with("BAD"));
            assert!(msg.starts_with(&format!("failed to fetch {}: ", symbol)), "{msg}");
        }
        for (symbol, record) in result.succeeded() {
            assert_eq!(&record.ticker_code, symbol);
            assert!(!record.data.is_empty());
        }
    }

    #[tokio::test]
    async fn test_symbol_recovering_in_later_round_appears_once() {
        let provider = ScriptedProvider::default();
        // two attempts per round: the first round burns both errors
        provider.history.lock().unwrap().insert(
            "FLAKY".into(),
            vec![
                Err("rate limited".into()),
                Err("rate limited".into()),
                Ok(sample_history(10)),
            ],
        );
        let provider = Arc::new(provider);
        let runner = BatchRunner::new(Arc::new(fetcher(provider.clone(), 2)), config(3));

        let (result, stats) = runner.run(&symbols(&["FLAKY", "OK"]), |r| Ok(r.data.len())).await;

        assert!(result.all_succeeded());
        assert_eq!(result.len(), 2);
        assert_eq!(result.succeeded()[&Symbol::parse("FLAKY").unwrap()], 10);
        assert_eq!(stats.rounds, 2);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_not_resubmitted() {
        let provider = Arc::new(ScriptedProvider {
            not_found: vec!["GONE".into()],
            always_fail: vec!["BAD".into()],
            ..Default::default()
        });
        let runner = BatchRunner::new(Arc::new(fetcher(provider.clone(), 1)), config(3));

        let (result, stats) = runner.run(&symbols(&["GONE", "BAD"]), |_| Ok(())).await;

        // BAD keeps all three rounds going; GONE is tried once
        assert_eq!(stats.rounds, 3);
        assert_eq!(provider.calls("history"), 1 + 3);
        assert_eq!(
            result.failed()[&Symbol::parse("GONE").unwrap()],
            "failed to fetch GONE: symbol not found: GONE"
        );
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_only_permanent_failures_end_early() {
        let provider = Arc::new(ScriptedProvider {
            not_found: vec!["GONE".into()],
            ..Default::default()
        });
        let runner = BatchRunner::new(Arc::new(fetcher(provider.clone(), 3)), config(5));

        let (result, stats) = runner.run(&symbols(&["GONE", "OK"]), |_| Ok(())).await;

        assert_eq!(stats.rounds, 1);
        assert_eq!(result.succeeded().len(), 1);
        assert_eq!(provider.calls("history"), 2);
    }

    #[tokio::test]
    async fn test_sink_error_marks_symbol_failed() {
        let provider = Arc::new(ScriptedProvider::default());
        let runner = BatchRunner::new(Arc::new(fetcher(provider, 1)), config(1));

        let (result, _) = runner
            .run(&symbols(&["AAA"]), |_| -> anyhow::Result<()> { anyhow::bail!("disk full") })
            .await;

        assert_eq!(result.failed()[&Symbol::parse("AAA").unwrap()], "failed to store AAA: disk full");
    }

    #[tokio::test]
    async fn test_all_succeed_in_single_round() {
        let provider = Arc::new(ScriptedProvider::default());
        let runner = BatchRunner::new(Arc::new(fetcher(provider.clone(), 1)), config(5));

        let (result, stats) = runner.run(&symbols(&["A", "B", "C"]), |_| Ok(())).await;
        assert!(result.all_succeeded());
        assert_eq!(stats.rounds, 1);
        assert_eq!(provider.calls("history"), 3);
    }
}
