//! Bounded waits on remote progress.
//!
//! Both waits wake on a new plan snapshot or on their poll interval, whichever
//! comes first, and give up with [`UpgradeError::Timeout`].

use std::time::Duration;

use anyhow::{Result, bail};

use super::{Engine, Snapshot};
use crate::error::UpgradeError;
use crate::plan::StepStatus;

/// True once the step is complete in the current snapshot. A failed step is an error.
fn step_complete(rx: &mut Snapshot, step_id: &str) -> Result<bool> {
    let plan = rx.borrow_and_update();
    let step = plan.require_step(step_id)?;
    match step.status {
        StepStatus::Complete => Ok(true),
        StepStatus::Failed => Err(UpgradeError::StepFailed {
            step_id: step_id.to_string(),
            description: step.status_description.clone(),
        }
        .into()),
        StepStatus::Pending | StepStatus::Starting | StepStatus::Running => Ok(false),
    }
}

/// Sleep for `poll`, returning early when a new snapshot is published.
async fn next_tick(rx: &mut Snapshot, poll: Duration) -> Result<()> {
    tokio::select! {
        changed = rx.changed() => {
            if changed.is_err() {
                bail!("plan snapshot channel closed");
            }
        }
        () = tokio::time::sleep(poll) => {}
    }
    Ok(())
}

impl Engine {
    /// Wait until a remote step completes or fails.
    pub(crate) async fn wait_for_step(
        &self,
        rx: &mut Snapshot,
        step_id: &str,
        timeout: Duration,
    ) -> Result<()> {
        let poll = self.config.step_poll_interval;
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if step_complete(rx, step_id)? {
                    return Ok::<_, anyhow::Error>(());
                }
                next_tick(rx, poll).await?;
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::timeout(format!("step {step_id}"), timeout).into()),
        }
    }

    /// Wait until the manager on `node_name` reconnects reporting `target_version`.
    ///
    /// A status report for the step ends the wait early, with an error when it
    /// reports failure.
    pub(crate) async fn wait_for_ec_manager_to_connect(
        &self,
        rx: &mut Snapshot,
        step_id: &str,
        node_name: &str,
        target_version: &str,
    ) -> Result<()> {
        let timeout = self.config.manager_upgrade_timeout;
        let poll = self.config.manager_poll_interval;
        let registry = self.dispatcher.registry();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                if registry.node_version(node_name).as_deref() == Some(target_version)
                    || step_complete(rx, step_id)?
                {
                    return Ok::<_, anyhow::Error>(());
                }
                next_tick(rx, poll).await?;
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(UpgradeError::timeout(
                format!("EC manager on {node_name} to reconnect at {target_version}"),
                timeout,
            )
            .into()),
        }
    }
}
