use crate::Dimensions;

/// Status taxonomy shared by every public entry point. Entry points return a
/// status plus best-effort partial results; they never panic for driver-side
/// failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorStatus {
    #[default]
    None,
    DeviceUnavailable,
    GeneralFailure,
    /// Partial success: output buffers were too small; shapes are reported so
    /// the caller can resize and retry.
    OutputInsufficientSize,
    InvalidArgument,
    /// Caller may retry with a relaxed deadline.
    MissedDeadlineTransient,
    /// Caller must not retry the same deadline.
    MissedDeadlinePersistent,
    ResourceExhaustedTransient,
    ResourceExhaustedPersistent,
    /// The driver process died. Triggers recovery in the versioned device
    /// core; terminal when recovery is exhausted.
    DeadObject,
}

impl ErrorStatus {
    pub fn is_ok(self) -> bool {
        self == ErrorStatus::None
    }
}

/// Driver-measured execution times in microseconds; u64::MAX means unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub time_on_device: u64,
    pub time_in_driver: u64,
}

impl Timing {
    pub const NONE: Timing = Timing {
        time_on_device: u64::MAX,
        time_in_driver: u64::MAX,
    };
}

impl Default for Timing {
    fn default() -> Self {
        Timing::NONE
    }
}

/// Actual shape of one execution output, reported even on partial success.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputShape {
    pub dimensions: Dimensions,
    pub is_sufficient: bool,
}

/// The `(status, output shapes, timing)` triple every execution path returns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    pub status: ErrorStatus,
    pub output_shapes: Vec<OutputShape>,
    pub timing: Timing,
}

impl ExecutionResult {
    pub fn failure(status: ErrorStatus) -> Self {
        Self {
            status,
            output_shapes: Vec::new(),
            timing: Timing::NONE,
        }
    }
}
