//! Command Batch Executor.
//!
//! The upstream applies a sync request command by command but does not
//! substitute temp ids *within* one request, so a batch is submitted in
//! dependency stages: every stage is one sync request, and the real ids
//! returned by a stage are written into the `args` of the next before it is
//! sent. A batch without references is a single round trip.
//!
//! Once a stage has been applied upstream it cannot be taken back. A
//! top-level failure on the first stage therefore rejects the batch, while
//! the same failure on a later stage only fails that stage's commands.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::aggregate::BatchResult;
use crate::command::{validate_batch, Command, DependencyGraph};
use crate::engine::Upstream;
use crate::error::EngineError;
use crate::ratelimit::BudgetClass;
use crate::transport::Transport;
use crate::types::SyncResponse;

type Outcome = Option<Result<(), String>>;

pub(crate) struct BatchExecutor<'a, T> {
    pub upstream: Upstream<'a, T>,
    pub max_batch_size: usize,
}

impl<T: Transport> BatchExecutor<'_, T> {
    pub async fn execute(
        &self,
        commands: &[Command],
        deadline: Instant,
    ) -> Result<BatchResult, EngineError> {
        let started = Instant::now();
        validate_batch(commands, self.max_batch_size)?;
        let graph = DependencyGraph::build(commands);
        let stages = graph.stages()?;
        tracing::debug!(commands = commands.len(), stages = stages.len(), "batch validated");

        let mut outcomes: Vec<Outcome> = vec![None; commands.len()];
        let mut mapping: HashMap<String, String> = HashMap::new();
        let mut applied_any = false;

        for (level, stage) in stages.iter().enumerate() {
            let mut ready = Vec::with_capacity(stage.len());
            for &index in stage {
                match failed_dependency(index, commands, &graph, &outcomes, &mapping) {
                    Some(message) => outcomes[index] = Some(Err(message)),
                    None => ready.push(index),
                }
            }
            if ready.is_empty() {
                continue;
            }

            if Instant::now() >= deadline {
                if !applied_any {
                    return Err(EngineError::DeadlineExceeded);
                }
                tracing::warn!(level, "deadline passed, remaining stages not submitted");
                break;
            }

            let batch: Vec<Command> = ready
                .iter()
                .map(|&i| commands[i].resolved(&mapping))
                .collect();
            tracing::debug!(level, commands = batch.len(), "submitting stage");

            let response = match self.submit(&batch, deadline).await {
                Ok(response) => response,
                Err(err) if !applied_any => return Err(err),
                Err(EngineError::DeadlineExceeded) => {
                    tracing::warn!(level, "deadline passed while stage was rate limited");
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        level,
                        error = %err,
                        "stage failed after earlier stages were applied"
                    );
                    let message = format!("batch submission failed: {err}");
                    for &index in &ready {
                        outcomes[index] = Some(Err(message.clone()));
                    }
                    continue;
                }
            };
            applied_any = true;

            for (&index, command) in ready.iter().zip(&batch) {
                let outcome = match response.sync_status.get(&command.correlation_id) {
                    Some(status) => status.failure().map_or(Ok(()), Err),
                    None => Err("upstream returned no status for this command".to_string()),
                };
                if outcome.is_ok() {
                    if let Some(temp_id) = &command.temp_id {
                        if let Some(real) = response.temp_id_mapping.get(temp_id) {
                            mapping.insert(temp_id.clone(), real.clone());
                        }
                    }
                }
                outcomes[index] = Some(outcome);
            }
        }

        let outcomes = outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| Err("deadline exceeded".to_string())))
            .collect();
        let result = BatchResult::from_outcomes(commands, outcomes, &mapping, started.elapsed());
        tracing::info!(
            commands = commands.len(),
            completed = result.completed_count,
            failed = result.failed_count,
            elapsed_ms = result.execution_time_ms,
            "batch finished"
        );
        Ok(result)
    }

    async fn submit(
        &self,
        batch: &[Command],
        deadline: Instant,
    ) -> Result<SyncResponse, EngineError> {
        let client = self.upstream.client;
        let request = client.build_sync(batch)?;
        let response = self.upstream.send(BudgetClass::Sync, deadline, request).await?;
        Ok(client.parse_sync(response)?)
    }
}

/// The failure message for `index` if one of its producers did not yield an
/// id.
fn failed_dependency(
    index: usize,
    commands: &[Command],
    graph: &DependencyGraph,
    outcomes: &[Outcome],
    mapping: &HashMap<String, String>,
) -> Option<String> {
    graph.producers_of(index).iter().find_map(|&producer| {
        let temp_id = commands[producer].temp_id.as_deref()?;
        let created = matches!(outcomes[producer], Some(Ok(()))) && mapping.contains_key(temp_id);
        (!created).then(|| format!("dependency failed: temp_id '{temp_id}' was not created"))
    })
}
