use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use accelport_burst::{create_burst_with_capacity, ExecutionBurstController, DEFAULT_CHANNEL_CAPACITY, DEFAULT_POLLING_WINDOW};
use accelport_core::{ErrorStatus, ExecutionResult, Model, Revision};
use accelport_memory::{OperandInfo, Request};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::versioned::wait_or_death;
use crate::{
    status_from_transport, DriverPreparedModel, FenceState, FencedResult, SyncFence,
    TransportError, VersionedDevice,
};

/// One compiled model on a backend, wrapped so callers get every execution
/// path regardless of the driver's revision: paths the driver lacks are
/// emulated from the ones it has.
pub struct VersionedPreparedModel {
    prepared: Arc<dyn DriverPreparedModel>,
    device: Weak<VersionedDevice>,
    device_name: String,
    revision: Revision,
    death: watch::Receiver<bool>,
    input_infos: Vec<OperandInfo>,
    output_infos: Vec<OperandInfo>,
}

impl VersionedPreparedModel {
    pub(crate) fn new(
        prepared: Arc<dyn DriverPreparedModel>,
        device: &Arc<VersionedDevice>,
        revision: Revision,
        model: Option<&Model>,
        death: watch::Receiver<bool>,
    ) -> Self {
        // A model prepared purely from cache carries no graph; allocation
        // roles against it cannot be resolved and are rejected at use.
        let (input_infos, output_infos) = match model {
            Some(model) => (
                io_infos(model, &model.input_indexes),
                io_infos(model, &model.output_indexes),
            ),
            None => (Vec::new(), Vec::new()),
        };
        Self {
            prepared,
            device: Arc::downgrade(device),
            device_name: device.name().to_owned(),
            revision,
            death,
            input_infos,
            output_infos,
        }
    }

    pub fn device(&self) -> Option<Arc<VersionedDevice>> {
        self.device.upgrade()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn input_info(&self, index: usize) -> Option<&OperandInfo> {
        self.input_infos.get(index)
    }

    pub fn output_info(&self, index: usize) -> Option<&OperandInfo> {
        self.output_infos.get(index)
    }

    /// Launch-then-wait execution. A driver death mid-call is observed as a
    /// dropped response channel or a flipped death watch; either way the
    /// caller gets a terminal `DeadObject` result, never a hang.
    pub async fn execute_asynchronously(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
    ) -> ExecutionResult {
        let (tx, rx) = oneshot::channel();
        match self.prepared.execute(request, measure, deadline, tx).await {
            Ok(ErrorStatus::None) => {}
            Ok(status) => return ExecutionResult::failure(status),
            Err(err) => return ExecutionResult::failure(status_from_transport(&err)),
        }
        match wait_or_death(self.death.clone(), rx).await {
            Ok(result) => result,
            Err(err) => {
                warn!(device = %self.device_name, error = %err, "execution lost to driver death");
                ExecutionResult::failure(status_from_transport(&err))
            }
        }
    }

    /// Synchronous execution; emulated over the asynchronous path for
    /// revisions that predate the synchronous entry point.
    pub async fn execute_synchronously(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
    ) -> ExecutionResult {
        if self.revision < Revision::V1_2 {
            return self.execute_asynchronously(request, measure, deadline).await;
        }
        match self
            .prepared
            .execute_synchronously(request, measure, deadline)
            .await
        {
            Ok(result) => result,
            Err(err) => ExecutionResult::failure(status_from_transport(&err)),
        }
    }

    /// Fence-gated execution. On revisions without native support the wait
    /// fences are waited on here and the work dispatched synchronously; the
    /// result then carries no output fence and no timing callback.
    pub async fn execute_fenced(
        &self,
        request: Request,
        wait_for: Vec<SyncFence>,
        measure: bool,
        deadline: Option<Instant>,
        timeout_after_fence: Option<Duration>,
    ) -> FencedResult {
        if self.revision >= Revision::V1_3 {
            return match self
                .prepared
                .execute_fenced(request, wait_for, measure, deadline, timeout_after_fence)
                .await
            {
                Ok(result) => result,
                Err(err) => FencedResult::failure(status_from_transport(&err)),
            };
        }

        debug!(
            device = %self.device_name,
            "no native fence-gated path; waiting locally and running synchronously"
        );
        let all_signaled = tokio::task::block_in_place(|| {
            wait_for
                .iter()
                .all(|fence| fence.wait(None) == FenceState::Signaled)
        });
        if !all_signaled {
            return FencedResult::failure(ErrorStatus::GeneralFailure);
        }
        let result = self.execute_synchronously(request, measure, deadline).await;
        FencedResult {
            status: result.status,
            sync_fence: None,
            callback: None,
            timing: result.timing,
        }
    }

    /// Opens a burst session against this prepared model. None when the
    /// revision predates bursts or the driver declines; callers then stay on
    /// the synchronous path.
    pub async fn configure_execution_burst(
        &self,
        prefer_power_over_latency: bool,
    ) -> Option<Arc<ExecutionBurstController>> {
        if self.revision < Revision::V1_2 {
            return None;
        }
        let polling_window = if prefer_power_over_latency {
            Duration::ZERO
        } else {
            DEFAULT_POLLING_WINDOW
        };
        let (controller, server) =
            create_burst_with_capacity(polling_window, DEFAULT_CHANNEL_CAPACITY);
        match self.prepared.configure_execution_burst(server).await {
            Ok(ErrorStatus::None) => Some(controller),
            Ok(status) => {
                debug!(device = %self.device_name, ?status, "driver declined burst session");
                None
            }
            Err(TransportError::Unsupported) => None,
            Err(err) => {
                warn!(device = %self.device_name, error = %err, "burst configuration failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for VersionedPreparedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedPreparedModel")
            .field("device", &self.device_name)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

fn io_infos(model: &Model, indexes: &[u32]) -> Vec<OperandInfo> {
    indexes
        .iter()
        .map(|&index| OperandInfo::from_operand(&model.operands[index as usize]))
        .collect()
}
