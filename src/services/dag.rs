use std::collections::BTreeMap;

use uuid::Uuid;

use crate::models::operation::{Operation, OperationParams};
use crate::services::queue::{Broker, QueueError, TaskMessage, TaskOp};

/// Dispatch plan for a job: a single task chained into finalize, or a
/// parallel fan-out joined by the finalize chord callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Chain { task: TaskMessage },
    Chord { tasks: Vec<TaskMessage> },
}

impl Plan {
    pub fn job_id(&self) -> Uuid {
        match self {
            Plan::Chain { task } => task.job_id,
            Plan::Chord { tasks } => tasks[0].job_id,
        }
    }

    pub fn task_count(&self) -> usize {
        match self {
            Plan::Chain { .. } => 1,
            Plan::Chord { tasks } => tasks.len(),
        }
    }

    fn tasks(&self) -> &[TaskMessage] {
        match self {
            Plan::Chain { task } => std::slice::from_ref(task),
            Plan::Chord { tasks } => tasks,
        }
    }

    /// Arm the join countdown, then publish every sibling. The finalize
    /// callback is enqueued by whichever worker completes the countdown.
    pub async fn dispatch(&self, broker: &Broker) -> Result<(), QueueError> {
        broker.init_chord(self.job_id(), self.task_count()).await?;
        for task in self.tasks() {
            broker.publish(task).await?;
        }
        tracing::info!(
            job_id = %self.job_id(),
            tasks = self.task_count(),
            shape = match self {
                Plan::Chain { .. } => "chain",
                Plan::Chord { .. } => "chord",
            },
            "Dispatched plan"
        );
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("no operations to plan")]
    NoOperations,
}

/// Build the dispatch plan for a validated operation list. Duplicates are
/// collapsed (first occurrence wins the ordering); a single surviving
/// operation becomes a chain, two or more a chord.
pub fn build(
    job_id: Uuid,
    source_key: &str,
    operations: &[Operation],
    params: &BTreeMap<Operation, OperationParams>,
    correlation_id: &str,
) -> Result<Plan, DagError> {
    let mut seen = Vec::new();
    for op in operations {
        if !seen.contains(op) {
            seen.push(*op);
        }
    }

    let mut tasks: Vec<TaskMessage> = seen
        .into_iter()
        .map(|op| {
            TaskMessage::new(
                job_id,
                TaskOp::from(op),
                source_key,
                params.get(&op).cloned().unwrap_or_default(),
                correlation_id,
            )
        })
        .collect();

    match tasks.len() {
        0 => Err(DagError::NoOperations),
        1 => Ok(Plan::Chain {
            task: tasks.remove(0),
        }),
        _ => Ok(Plan::Chord { tasks }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::queue::QueueName;

    fn params_for(op: Operation, quality: u8) -> BTreeMap<Operation, OperationParams> {
        let mut map = BTreeMap::new();
        map.insert(
            op,
            OperationParams {
                quality: Some(quality),
                resize: None,
            },
        );
        map
    }

    #[test]
    fn single_operation_yields_chain() {
        let plan = build(
            Uuid::new_v4(),
            "raw/x/a.png",
            &[Operation::Webp],
            &BTreeMap::new(),
            "req",
        )
        .unwrap();

        assert!(matches!(plan, Plan::Chain { .. }));
        assert_eq!(plan.task_count(), 1);
    }

    #[test]
    fn multiple_operations_yield_chord() {
        let plan = build(
            Uuid::new_v4(),
            "raw/x/a.png",
            &[Operation::Webp, Operation::Avif, Operation::Metadata],
            &BTreeMap::new(),
            "req",
        )
        .unwrap();

        match &plan {
            Plan::Chord { tasks } => {
                assert_eq!(tasks.len(), 3);
                let ops: Vec<TaskOp> = tasks.iter().map(|t| t.operation).collect();
                assert_eq!(ops, vec![TaskOp::Webp, TaskOp::Avif, TaskOp::Metadata]);
            }
            other => panic!("expected chord, got {other:?}"),
        }
    }

    #[test]
    fn duplicates_collapse_before_dispatch() {
        let plan = build(
            Uuid::new_v4(),
            "raw/x/a.png",
            &[Operation::Webp, Operation::Webp, Operation::Webp],
            &BTreeMap::new(),
            "req",
        )
        .unwrap();

        assert!(matches!(plan, Plan::Chain { .. }));
    }

    #[test]
    fn params_land_on_their_operation_only() {
        let plan = build(
            Uuid::new_v4(),
            "raw/x/a.png",
            &[Operation::Webp, Operation::Avif],
            &params_for(Operation::Webp, 80),
            "req",
        )
        .unwrap();

        let Plan::Chord { tasks } = &plan else {
            panic!("expected chord");
        };
        assert_eq!(tasks[0].params.quality, Some(80));
        assert!(tasks[1].params.is_empty());
    }

    #[test]
    fn denoise_sibling_targets_ml_queue() {
        let plan = build(
            Uuid::new_v4(),
            "raw/x/a.png",
            &[Operation::Webp, Operation::Denoise],
            &BTreeMap::new(),
            "req",
        )
        .unwrap();

        let Plan::Chord { tasks } = &plan else {
            panic!("expected chord");
        };
        assert_eq!(tasks[0].operation.queue(), QueueName::Standard);
        assert_eq!(tasks[1].operation.queue(), QueueName::MlInference);
    }

    #[test]
    fn empty_list_is_a_bug_upstream() {
        let err = build(Uuid::new_v4(), "raw/x/a.png", &[], &BTreeMap::new(), "req");
        assert!(matches!(err, Err(DagError::NoOperations)));
    }
}
