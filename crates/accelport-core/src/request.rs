use crate::{DataLocation, Dimensions};

/// Whether an execution argument is backed by a pool range or deliberately
/// omitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentLifetime {
    Pool,
    NoValue,
}

/// One input or output of an execution request. `location.pool` indexes the
/// request's pool table; `dimensions` may refine the model operand's shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestArgument {
    pub lifetime: ArgumentLifetime,
    pub location: DataLocation,
    pub dimensions: Dimensions,
}

impl RequestArgument {
    pub fn no_value() -> Self {
        Self {
            lifetime: ArgumentLifetime::NoValue,
            location: DataLocation::default(),
            dimensions: Dimensions::default(),
        }
    }

    pub fn has_no_value(&self) -> bool {
        self.lifetime == ArgumentLifetime::NoValue
    }
}

/// Compilation preference forwarded to the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionPreference {
    LowPower,
    #[default]
    FastSingleAnswer,
    SustainedSpeed,
}

/// Relative priority among the preparing client's models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}
