use std::sync::Arc;
use std::time::{Duration, Instant};

use accelport_burst::{ExecutionBurstController, SendStatus};
use accelport_core::{ErrorStatus, ExecutionResult, RequestArgument};
use accelport_device::{FencedResult, SyncFence, VersionedPreparedModel};
use accelport_memory::{IoRole, Request, RequestPool};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Outcome of a burst dispatch attempt.
pub enum BurstOutcome {
    Completed(ExecutionResult),
    /// The request cannot travel over the burst session (non-representable
    /// pool, channel overflow, invalidated session). The caller should rerun
    /// it through the synchronous path.
    FallbackRequested,
}

/// Handle to an in-flight asynchronous execution. `wait` always resolves to
/// a terminal result, even if the backing task is lost.
pub struct ExecutionHandle {
    rx: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    pub async fn wait(self) -> ExecutionResult {
        self.rx
            .await
            .unwrap_or_else(|_| ExecutionResult::failure(ErrorStatus::GeneralFailure))
    }
}

/// Dispatches executions against one prepared model. Thread-safe; overlapping
/// executions are permitted and carry no implicit ordering. Deadlines are
/// forwarded to the driver, never enforced locally.
pub struct ExecutionDispatcher {
    prepared: Arc<VersionedPreparedModel>,
}

impl ExecutionDispatcher {
    pub fn new(prepared: Arc<VersionedPreparedModel>) -> Self {
        Self { prepared }
    }

    pub fn prepared(&self) -> &Arc<VersionedPreparedModel> {
        &self.prepared
    }

    pub async fn execute_synchronous(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
    ) -> ExecutionResult {
        if !validate_request(&self.prepared, &request) {
            return ExecutionResult::failure(ErrorStatus::InvalidArgument);
        }
        let result = self
            .prepared
            .execute_synchronously(request.clone(), measure, deadline)
            .await;
        mark_outputs(&request, result.status.is_ok());
        result
    }

    /// Fire-and-wait-later dispatch. The returned handle owns the result;
    /// dropping it abandons the execution without cancelling it.
    pub fn execute_asynchronous(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
    ) -> ExecutionHandle {
        let prepared = self.prepared.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = if validate_request(&prepared, &request) {
                let result = prepared
                    .execute_asynchronously(request.clone(), measure, deadline)
                    .await;
                mark_outputs(&request, result.status.is_ok());
                result
            } else {
                ExecutionResult::failure(ErrorStatus::InvalidArgument)
            };
            let _ = tx.send(result);
        });
        ExecutionHandle { rx }
    }

    /// Dispatch over an open burst session. The blocking ring-channel calls
    /// are bridged off the async executor.
    pub async fn execute_burst(
        &self,
        controller: &ExecutionBurstController,
        request: Request,
        measure: bool,
    ) -> BurstOutcome {
        if !validate_request(&self.prepared, &request) {
            return BurstOutcome::Completed(ExecutionResult::failure(
                ErrorStatus::InvalidArgument,
            ));
        }
        match controller.send(&request, measure) {
            SendStatus::Sent => {}
            status @ (SendStatus::ChannelUnavailable | SendStatus::NotRepresentable) => {
                debug!(?status, "burst send declined; requesting fallback");
                return BurstOutcome::FallbackRequested;
            }
        }
        match tokio::task::block_in_place(|| controller.receive()) {
            Some((status, output_shapes, timing)) => {
                mark_outputs(&request, status.is_ok());
                BurstOutcome::Completed(ExecutionResult {
                    status,
                    output_shapes,
                    timing,
                })
            }
            None => {
                // A result lost after a successful send means the session
                // died mid-execution; that is terminal, not retriable.
                warn!("burst session lost while awaiting a result");
                mark_outputs(&request, false);
                BurstOutcome::Completed(ExecutionResult::failure(ErrorStatus::DeadObject))
            }
        }
    }

    pub async fn execute_fenced(
        &self,
        request: Request,
        wait_for: Vec<SyncFence>,
        measure: bool,
        deadline: Option<Instant>,
        timeout_after_fence: Option<Duration>,
    ) -> FencedResult {
        if !validate_request(&self.prepared, &request) {
            return FencedResult::failure(ErrorStatus::InvalidArgument);
        }
        let result = self
            .prepared
            .execute_fenced(request.clone(), wait_for, measure, deadline, timeout_after_fence)
            .await;
        mark_outputs(&request, result.status.is_ok());
        result
    }
}

fn validate_arguments(
    request: &Request,
    arguments: &[RequestArgument],
    role: IoRole,
    info_for: impl Fn(usize) -> Option<accelport_memory::OperandInfo>,
) -> bool {
    for (index, argument) in arguments.iter().enumerate() {
        if argument.has_no_value() {
            continue;
        }
        let pool = match request.pools.get(argument.location.pool as usize) {
            Some(pool) => pool,
            None => {
                warn!(index, "argument references a pool outside the request");
                return false;
            }
        };
        let memory = match pool {
            RequestPool::Memory(memory) => memory,
            // Token pools are resolved and checked by the driver.
            RequestPool::DeviceToken(_) => continue,
        };
        // Absent operand info (model prepared purely from cache) skips the
        // shape check; the driver still validates.
        if let Some(info) = info_for(index) {
            if !memory.validate(role, &info, argument.location.offset, argument.location.length)
            {
                warn!(index, ?role, "argument failed buffer validation");
                return false;
            }
        }
    }
    true
}

fn validate_request(prepared: &VersionedPreparedModel, request: &Request) -> bool {
    validate_arguments(request, &request.inputs, IoRole::Input, |index| {
        prepared.input_info(index).cloned()
    }) && validate_arguments(request, &request.outputs, IoRole::Output, |index| {
        prepared.output_info(index).cloned()
    })
}

/// Flips the initialized flag on every CPU-reachable output buffer: set on
/// success, cleared on failure so stale contents cannot be read back.
fn mark_outputs(request: &Request, success: bool) {
    for argument in &request.outputs {
        if argument.has_no_value() {
            continue;
        }
        let memory = request
            .pools
            .get(argument.location.pool as usize)
            .and_then(|pool| pool.as_memory());
        if let Some(memory) = memory {
            memory.validator().set_initialized(success);
        }
    }
}
