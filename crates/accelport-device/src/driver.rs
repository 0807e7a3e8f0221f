use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};

use accelport_burst::BurstServer;
use accelport_core::{
    Capabilities, ErrorStatus, ExecutionPreference, ExecutionResult, Model, Priority, Revision,
    Timing,
};
use accelport_memory::{BufferDesc, Memory, OperandInfo, Request};
use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::{FencedExecutionCallback, SyncFence};

/// Transport-level failure of an abstract RPC call. `DeadObject` means the
/// driver process died; `Unsupported` means the method does not exist at the
/// probed revision (detected at connect time, never at call time).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    DeadObject,
    Unsupported,
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::DeadObject => write!(f, "driver process is dead"),
            TransportError::Unsupported => write!(f, "method not present at this revision"),
            TransportError::Other(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = Result<T, TransportError>;

/// Converts a transport failure to the closest logical status rather than
/// leaking transport detail.
pub fn status_from_transport(err: &TransportError) -> ErrorStatus {
    match err {
        TransportError::DeadObject => ErrorStatus::DeadObject,
        TransportError::Unsupported => ErrorStatus::GeneralFailure,
        TransportError::Other(_) => ErrorStatus::GeneralFailure,
    }
}

pub const CACHE_TOKEN_LEN: usize = 32;

/// Opaque byte sequence identifying a (model, backend) pair for compiled
/// artifact reuse. Caller-supplied, not cryptographically meaningful.
pub type CacheToken = [u8; CACHE_TOKEN_LEN];

/// Terminal response of an asynchronous model preparation.
pub struct PrepareResponse {
    pub status: ErrorStatus,
    pub prepared: Option<Arc<dyn DriverPreparedModel>>,
}

impl PrepareResponse {
    pub fn failure(status: ErrorStatus) -> Self {
        Self {
            status,
            prepared: None,
        }
    }
}

/// Result of a fence-gated dispatch.
pub struct FencedResult {
    pub status: ErrorStatus,
    pub sync_fence: Option<SyncFence>,
    pub callback: Option<Arc<dyn FencedExecutionCallback>>,
    pub timing: Timing,
}

impl FencedResult {
    pub fn failure(status: ErrorStatus) -> Self {
        Self {
            status,
            sync_fence: None,
            callback: None,
            timing: Timing::NONE,
        }
    }
}

/// Abstract RPC surface of one backend driver service. All methods take the
/// revision negotiated at connect time; a driver must answer `Unsupported`
/// cleanly for revisions it does not speak.
///
/// Asynchronous methods (`prepare_model*`, `DriverPreparedModel::execute`)
/// launch quickly and deliver their terminal response through the supplied
/// oneshot sender; dropping the sender without sending is how a crashing
/// driver is observed mid-call.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Liveness watcher; flips to true exactly once when the service dies.
    fn death_watch(&self) -> watch::Receiver<bool>;

    async fn ping(&self) -> TransportResult<()>;

    async fn get_capabilities(
        &self,
        revision: Revision,
    ) -> TransportResult<(ErrorStatus, Capabilities)>;

    async fn get_supported_operations(
        &self,
        revision: Revision,
        model: &Model,
    ) -> TransportResult<(ErrorStatus, Vec<bool>)>;

    /// `(status, num_model_cache, num_data_cache)`; revision 1.2+.
    async fn get_number_of_cache_files_needed(&self)
        -> TransportResult<(ErrorStatus, u32, u32)>;

    #[allow(clippy::too_many_arguments)]
    async fn prepare_model(
        &self,
        revision: Revision,
        model: &Model,
        preference: ExecutionPreference,
        priority: Priority,
        deadline: Option<Instant>,
        model_cache: Vec<File>,
        data_cache: Vec<File>,
        token: Option<CacheToken>,
        response: oneshot::Sender<PrepareResponse>,
    ) -> TransportResult<ErrorStatus>;

    /// Revision 1.2+. Any failure means the caller must fall back to a full
    /// `prepare_model`.
    async fn prepare_model_from_cache(
        &self,
        deadline: Option<Instant>,
        model_cache: Vec<File>,
        data_cache: Vec<File>,
        token: CacheToken,
        response: oneshot::Sender<PrepareResponse>,
    ) -> TransportResult<ErrorStatus>;

    /// Driver-resident buffer allocation; revision 1.3. Returns the memory
    /// object (device kind) and its non-zero driver token.
    async fn allocate(
        &self,
        desc: &BufferDesc,
        input_roles: &[OperandInfo],
        output_roles: &[OperandInfo],
    ) -> TransportResult<(ErrorStatus, Option<Memory>, u32)>;
}

/// Abstract RPC surface of one prepared model held by a driver.
#[async_trait]
pub trait DriverPreparedModel: Send + Sync {
    /// Asynchronous launch; terminal result via `response`.
    async fn execute(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
        response: oneshot::Sender<ExecutionResult>,
    ) -> TransportResult<ErrorStatus>;

    /// True synchronous entry point; revision 1.2+.
    async fn execute_synchronously(
        &self,
        request: Request,
        measure: bool,
        deadline: Option<Instant>,
    ) -> TransportResult<ExecutionResult>;

    /// Fence-gated dispatch; revision 1.3.
    async fn execute_fenced(
        &self,
        request: Request,
        wait_for: Vec<SyncFence>,
        measure: bool,
        deadline: Option<Instant>,
        timeout_after_fence: Option<Duration>,
    ) -> TransportResult<FencedResult>;

    /// Hands the server half of a burst session to the driver; revision 1.2+.
    async fn configure_execution_burst(
        &self,
        server: Arc<BurstServer>,
    ) -> TransportResult<ErrorStatus>;
}

/// Re-invoked by the versioned device core to obtain a fresh handle, both at
/// connect time and during crash recovery.
pub trait DriverFactory: Send + Sync {
    fn connect(&self) -> Option<Arc<dyn Driver>>;
}

impl<F> DriverFactory for F
where
    F: Fn() -> Option<Arc<dyn Driver>> + Send + Sync,
{
    fn connect(&self) -> Option<Arc<dyn Driver>> {
        self()
    }
}
