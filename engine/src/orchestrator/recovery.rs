//! Startup recovery of records left in flight by a previous process

use crate::db::Database;
use sdk::errors::EngineError;
use serde::Serialize;
use tracing::{info, warn};

/// How many records a recovery pass finalized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub outputs: u64,
    pub workflow_outputs: u64,
}

impl RecoveryReport {
    pub fn total(&self) -> u64 {
        self.outputs + self.workflow_outputs
    }
}

/// Mark every Output and WorkflowOutput still loading as interrupted
///
/// Must run before the coordination loop starts dispatching, otherwise a
/// fresh in-flight record would be caught too. A second pass changes nothing.
pub async fn recover_interrupted(db: &Database) -> Result<RecoveryReport, EngineError> {
    let message = EngineError::Interrupted.to_string();

    let outputs = db
        .outputs()
        .interrupt_loading(&message)
        .await
        .map_err(|e| EngineError::Database(e.to_string()))?;
    let workflow_outputs = db
        .workflow_outputs()
        .interrupt_loading(&message)
        .await
        .map_err(|e| EngineError::Database(e.to_string()))?;

    let report = RecoveryReport {
        outputs,
        workflow_outputs,
    };

    if report.total() > 0 {
        warn!(
            "Recovered {} interrupted outputs and {} interrupted workflow outputs",
            outputs, workflow_outputs
        );
    } else {
        info!("No interrupted outputs to recover");
    }

    Ok(report)
}
