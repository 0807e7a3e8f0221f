use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use accelport_burst::BurstServer;
use accelport_core::{
    Capabilities, Dimensions, ErrorStatus, ExecutionPreference, ExecutionResult, Model,
    OperandType, OutputShape, PerformanceInfo, Priority, Revision, Timing,
};
use accelport_device::{
    CacheToken, Driver, DriverFactory, DriverPreparedModel, FenceState, FencedExecutionCallback,
    FencedResult, PrepareResponse, SyncFence, TransportError, TransportResult,
};
use accelport_memory::{
    combine_role_operands, required_size, BufferDesc, Memory, MemoryObject, Metadata, OperandInfo,
    Request,
};
use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

const CACHE_MARKER: &[u8] = b"accelport-loopback-cache\n";

/// Per-call counters, readable while the driver runs.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub pings: AtomicUsize,
    pub capability_queries: AtomicUsize,
    pub supported_queries: AtomicUsize,
    pub prepares: AtomicUsize,
    pub cache_prepares: AtomicUsize,
    pub executions: AtomicUsize,
    pub burst_executions: AtomicUsize,
    pub allocations: AtomicUsize,
}

struct Inner {
    name: String,
    top_revision: Revision,
    dead: AtomicBool,
    death_tx: watch::Sender<bool>,
    fail_next: AtomicU32,
    counters: CallCounters,
    /// Tokens whose artifacts this driver instance has produced; emptied by a
    /// simulated crash because a fresh instance starts cold.
    cached: Mutex<HashMap<CacheToken, CachedSeed>>,
    bursts: Mutex<Vec<Arc<BurstServer>>>,
    next_buffer_token: AtomicU32,
}

#[derive(Clone)]
struct CachedSeed {
    input_dims: Vec<Dimensions>,
    output_dims: Vec<Dimensions>,
}

impl Inner {
    fn check_alive(&self) -> TransportResult<()> {
        if self.dead.load(Ordering::Acquire) {
            Err(TransportError::DeadObject)
        } else {
            Ok(())
        }
    }

    /// Consumes one injected failure, if armed.
    fn take_injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// An in-process driver with a configurable top interface revision and fault
/// injection hooks.
pub struct LoopbackDriver {
    inner: Arc<Inner>,
}

impl LoopbackDriver {
    pub fn new(name: impl Into<String>, top_revision: Revision) -> Arc<Self> {
        let (death_tx, _) = watch::channel(false);
        Arc::new(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                top_revision,
                dead: AtomicBool::new(false),
                death_tx,
                fail_next: AtomicU32::new(0),
                counters: CallCounters::default(),
                cached: Mutex::new(HashMap::new()),
                bursts: Mutex::new(Vec::new()),
                next_buffer_token: AtomicU32::new(1),
            }),
        })
    }

    /// Simulates a driver process crash: every subsequent call answers
    /// DeadObject, the death watch flips, and open burst sessions die.
    pub fn kill(&self) {
        info!(driver = %self.inner.name, "simulating driver death");
        self.inner.dead.store(true, Ordering::Release);
        let _ = self.inner.death_tx.send(true);
        for server in self.inner.bursts.lock().unwrap().drain(..) {
            server.invalidate();
        }
    }

    /// Undoes `kill` on this same instance. Recovery tests normally reconnect
    /// through a factory instead; this exists for in-place liveness tests.
    pub fn revive(&self) {
        self.inner.dead.store(false, Ordering::Release);
        let _ = self.inner.death_tx.send(false);
    }

    /// Arms the next `n` logical calls to answer GeneralFailure.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::Release);
    }

    pub fn counters(&self) -> &CallCounters {
        &self.inner.counters
    }

    fn capabilities() -> Capabilities {
        let fast = PerformanceInfo {
            exec_time: 0.5,
            power_usage: 0.5,
        };
        Capabilities {
            relaxed_float32_performance_scalar: fast,
            relaxed_float32_performance_tensor: fast,
            operand_performance: vec![
                (OperandType::TensorFloat32, fast),
                (OperandType::TensorQuant8Asymm, fast),
                (OperandType::TensorInt32, fast),
            ],
            if_performance: fast,
            while_performance: fast,
        }
    }
}

fn seed_from_model(model: &Model) -> CachedSeed {
    let dims_of = |indexes: &[u32]| {
        indexes
            .iter()
            .map(|&i| model.operands[i as usize].dimensions.clone())
            .collect()
    };
    CachedSeed {
        input_dims: dims_of(&model.input_indexes),
        output_dims: dims_of(&model.output_indexes),
    }
}

fn write_marker(files: &mut [File]) {
    for file in files {
        if let Err(err) = file.write_all(CACHE_MARKER) {
            warn!(error = %err, "failed to write cache marker");
        }
    }
}

#[async_trait]
impl Driver for LoopbackDriver {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn death_watch(&self) -> watch::Receiver<bool> {
        self.inner.death_tx.subscribe()
    }

    async fn ping(&self) -> TransportResult<()> {
        self.inner.counters.pings.fetch_add(1, Ordering::Relaxed);
        self.inner.check_alive()
    }

    async fn get_capabilities(
        &self,
        revision: Revision,
    ) -> TransportResult<(ErrorStatus, Capabilities)> {
        self.inner
            .counters
            .capability_queries
            .fetch_add(1, Ordering::Relaxed);
        self.inner.check_alive()?;
        if revision > self.inner.top_revision {
            return Err(TransportError::Unsupported);
        }
        Ok((ErrorStatus::None, Self::capabilities()))
    }

    async fn get_supported_operations(
        &self,
        revision: Revision,
        model: &Model,
    ) -> TransportResult<(ErrorStatus, Vec<bool>)> {
        self.inner
            .counters
            .supported_queries
            .fetch_add(1, Ordering::Relaxed);
        self.inner.check_alive()?;
        if revision > self.inner.top_revision {
            return Err(TransportError::Unsupported);
        }
        if self.inner.take_injected_failure() {
            return Ok((ErrorStatus::GeneralFailure, Vec::new()));
        }
        Ok((ErrorStatus::None, vec![true; model.operations.len()]))
    }

    async fn get_number_of_cache_files_needed(
        &self,
    ) -> TransportResult<(ErrorStatus, u32, u32)> {
        self.inner.check_alive()?;
        if self.inner.top_revision < Revision::V1_2 {
            return Err(TransportError::Unsupported);
        }
        Ok((ErrorStatus::None, 1, 1))
    }

    async fn prepare_model(
        &self,
        revision: Revision,
        model: &Model,
        _preference: ExecutionPreference,
        _priority: Priority,
        deadline: Option<Instant>,
        mut model_cache: Vec<File>,
        mut data_cache: Vec<File>,
        token: Option<CacheToken>,
        response: oneshot::Sender<PrepareResponse>,
    ) -> TransportResult<ErrorStatus> {
        self.inner.counters.prepares.fetch_add(1, Ordering::Relaxed);
        self.inner.check_alive()?;
        if revision > self.inner.top_revision {
            return Err(TransportError::Unsupported);
        }
        if self.inner.take_injected_failure() {
            let _ = response.send(PrepareResponse::failure(ErrorStatus::GeneralFailure));
            return Ok(ErrorStatus::None);
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            let _ = response.send(PrepareResponse::failure(
                ErrorStatus::MissedDeadlineTransient,
            ));
            return Ok(ErrorStatus::None);
        }
        if model.validate().is_err() {
            let _ = response.send(PrepareResponse::failure(ErrorStatus::InvalidArgument));
            return Ok(ErrorStatus::None);
        }

        let seed = seed_from_model(model);
        if let Some(token) = token {
            write_marker(&mut model_cache);
            write_marker(&mut data_cache);
            self.inner.cached.lock().unwrap().insert(token, seed.clone());
            debug!(driver = %self.inner.name, "stored compiled artifacts for token");
        }
        let prepared = LoopbackPreparedModel {
            inner: self.inner.clone(),
            seed,
        };
        let _ = response.send(PrepareResponse {
            status: ErrorStatus::None,
            prepared: Some(Arc::new(prepared)),
        });
        Ok(ErrorStatus::None)
    }

    async fn prepare_model_from_cache(
        &self,
        deadline: Option<Instant>,
        model_cache: Vec<File>,
        data_cache: Vec<File>,
        token: CacheToken,
        response: oneshot::Sender<PrepareResponse>,
    ) -> TransportResult<ErrorStatus> {
        self.inner
            .counters
            .cache_prepares
            .fetch_add(1, Ordering::Relaxed);
        self.inner.check_alive()?;
        if self.inner.top_revision < Revision::V1_2 {
            return Err(TransportError::Unsupported);
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            let _ = response.send(PrepareResponse::failure(
                ErrorStatus::MissedDeadlineTransient,
            ));
            return Ok(ErrorStatus::None);
        }
        if model_cache.is_empty() || data_cache.is_empty() {
            let _ = response.send(PrepareResponse::failure(ErrorStatus::GeneralFailure));
            return Ok(ErrorStatus::None);
        }
        let seed = self.inner.cached.lock().unwrap().get(&token).cloned();
        match seed {
            Some(seed) => {
                let prepared = LoopbackPreparedModel {
                    inner: self.inner.clone(),
                    seed,
                };
                let _ = response.send(PrepareResponse {
                    status: ErrorStatus::None,
                    prepared: Some(Arc::new(prepared)),
                });
            }
            None => {
                // A fresh instance after a crash starts with a cold cache.
                debug!(driver = %self.inner.name, "no artifacts for token");
                let _ = response.send(PrepareResponse::failure(ErrorStatus::GeneralFailure));
            }
        }
        Ok(ErrorStatus::None)
    }

    async fn allocate(
        &self,
        desc: &BufferDesc,
        input_roles: &[OperandInfo],
        output_roles: &[OperandInfo],
    ) -> TransportResult<(ErrorStatus, Option<Memory>, u32)> {
        self.inner
            .counters
            .allocations
            .fetch_add(1, Ordering::Relaxed);
        self.inner.check_alive()?;
        if self.inner.top_revision < Revision::V1_3 {
            return Err(TransportError::Unsupported);
        }
        let mut all_roles = input_roles.to_vec();
        all_roles.extend_from_slice(output_roles);
        let combined = match combine_role_operands(desc, &all_roles) {
            Ok(combined) => combined,
            Err(status) => return Ok((status, None, 0)),
        };
        let size = match required_size(&combined, &combined.dimensions) {
            Some(size) if size > 0 => size,
            _ => return Ok((ErrorStatus::ResourceExhaustedPersistent, None, 0)),
        };
        let token = self.inner.next_buffer_token.fetch_add(1, Ordering::Relaxed);
        let staging = Arc::new(Mutex::new(vec![0u8; size]));
        let memory = MemoryObject::new_device(
            token,
            self.inner.name.clone(),
            Some(staging),
            Metadata::from_operand(&combined, size),
            input_roles.to_vec(),
            output_roles.to_vec(),
        );
        Ok((ErrorStatus::None, Some(memory), token))
    }
}

/// One trivially prepared model: execution validates the request's argument
/// counts and answers the model's output shapes, without computing anything.
pub struct LoopbackPreparedModel {
    inner: Arc<Inner>,
    seed: CachedSeed,
}

impl LoopbackPreparedModel {
    fn run(&self, request: &Request, measure: bool, deadline: Option<Instant>) -> ExecutionResult {
        self.inner
            .counters
            .executions
            .fetch_add(1, Ordering::Relaxed);
        if self.inner.take_injected_failure() {
            return ExecutionResult::failure(ErrorStatus::GeneralFailure);
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            return ExecutionResult::failure(ErrorStatus::MissedDeadlineTransient);
        }
        if request.inputs.len() != self.seed.input_dims.len()
            || request.outputs.len() != self.seed.output_dims.len()
        {
            return ExecutionResult::failure(ErrorStatus::InvalidArgument);
        }
        let output_shapes = self
            .seed
            .output_dims
            .iter()
            .map(|dims| OutputShape {
                dimensions: dims.clone(),
                is_sufficient: true,
            })
            .collect();
        let timing = if measure {
            Timing {
                time_on_device: 1,
                time_in_driver: 2,
            }
        } else {
            Timing::NONE
        };
        ExecutionResult {
            status: ErrorStatus::None,
            output_shapes,
            timing,
        }
    }
}

#[async_trait]
impl DriverPreparedModel for LoopbackPreparedModel {
    async fn execute(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
        response: oneshot::Sender<ExecutionResult>,
    ) -> TransportResult<ErrorStatus> {
        self.inner.check_alive()?;
        let _ = response.send(self.run(&request, measure, deadline));
        Ok(ErrorStatus::None)
    }

    async fn execute_synchronously(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
    ) -> TransportResult<ExecutionResult> {
        self.inner.check_alive()?;
        if self.inner.top_revision < Revision::V1_2 {
            return Err(TransportError::Unsupported);
        }
        Ok(self.run(&request, measure, deadline))
    }

    async fn execute_fenced(
        &self,
        request: Request,
        wait_for: Vec<SyncFence>,
        measure: bool,
        deadline: Option<Instant>,
        _timeout_after_fence: Option<Duration>,
    ) -> TransportResult<FencedResult> {
        self.inner.check_alive()?;
        if self.inner.top_revision < Revision::V1_3 {
            return Err(TransportError::Unsupported);
        }
        let gated = tokio::task::block_in_place(|| {
            wait_for
                .iter()
                .all(|fence| fence.wait(None) == FenceState::Signaled)
        });
        if !gated {
            return Ok(FencedResult::failure(ErrorStatus::GeneralFailure));
        }
        let result = self.run(&request, measure, deadline);
        if result.status != ErrorStatus::None {
            return Ok(FencedResult::failure(result.status));
        }
        let callback = LoopbackFencedCallback {
            status: result.status,
            timing: result.timing,
        };
        Ok(FencedResult {
            status: ErrorStatus::None,
            sync_fence: Some(SyncFence::signaled()),
            callback: Some(Arc::new(callback)),
            timing: result.timing,
        })
    }

    async fn configure_execution_burst(
        &self,
        server: Arc<BurstServer>,
    ) -> TransportResult<ErrorStatus> {
        self.inner.check_alive()?;
        if self.inner.top_revision < Revision::V1_2 {
            return Err(TransportError::Unsupported);
        }
        self.inner.bursts.lock().unwrap().push(server.clone());
        let inner = self.inner.clone();
        let seed = self.seed.clone();
        std::thread::spawn(move || {
            while let Some((burst_request, _memories, measure)) = server.wait_request() {
                inner
                    .counters
                    .burst_executions
                    .fetch_add(1, Ordering::Relaxed);
                let (status, shapes): (ErrorStatus, Vec<OutputShape>) =
                    if burst_request.inputs.len() == seed.input_dims.len()
                        && burst_request.outputs.len() == seed.output_dims.len()
                    {
                        let shapes = seed
                            .output_dims
                            .iter()
                            .map(|dims| OutputShape {
                                dimensions: dims.clone(),
                                is_sufficient: true,
                            })
                            .collect();
                        (ErrorStatus::None, shapes)
                    } else {
                        (ErrorStatus::InvalidArgument, Vec::new())
                    };
                let timing = if measure {
                    Timing {
                        time_on_device: 1,
                        time_in_driver: 2,
                    }
                } else {
                    Timing::NONE
                };
                if !server.send_result(status, &shapes, timing) {
                    break;
                }
            }
            debug!("burst server loop stopped");
        });
        Ok(ErrorStatus::None)
    }
}

struct LoopbackFencedCallback {
    status: ErrorStatus,
    timing: Timing,
}

impl FencedExecutionCallback for LoopbackFencedCallback {
    fn execution_info(&self) -> (ErrorStatus, Timing, Timing) {
        (self.status, self.timing, self.timing)
    }
}

/// Reconnecting factory: every `connect` hands out a fresh driver instance,
/// the way a restarted service would. Tests inspect `connects` and reach the
/// live instance through `current` to inject faults.
pub struct LoopbackFactory {
    name: String,
    top_revision: Revision,
    connects: AtomicUsize,
    refuse: AtomicBool,
    current: Mutex<Option<Arc<LoopbackDriver>>>,
}

impl LoopbackFactory {
    pub fn new(name: impl Into<String>, top_revision: Revision) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            top_revision,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Makes every subsequent connect fail until cleared, so recovery can be
    /// driven into its unrecoverable branch.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }

    pub fn current(&self) -> Option<Arc<LoopbackDriver>> {
        self.current.lock().unwrap().clone()
    }

    pub fn connect(&self) -> Option<Arc<dyn Driver>> {
        if self.refuse.load(Ordering::Acquire) {
            return None;
        }
        self.connects.fetch_add(1, Ordering::AcqRel);
        let driver = LoopbackDriver::new(self.name.clone(), self.top_revision);
        *self.current.lock().unwrap() = Some(driver.clone());
        Some(driver)
    }

    /// This factory as a `DriverFactory`, for `VersionedDevice::connect`.
    pub fn boxed(self: &Arc<Self>) -> Box<dyn DriverFactory> {
        let factory = Arc::clone(self);
        Box::new(move || factory.connect())
    }
}
