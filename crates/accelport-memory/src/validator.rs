use accelport_core::{combine_dimensions, operand_byte_size, Dimensions, Operand, OperandType};
use tracing::warn;

/// How a buffer is about to be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoRole {
    Input,
    Output,
}

/// The operand a buffer stands in for during validation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperandInfo {
    pub ty: Option<OperandType>,
    pub dimensions: Dimensions,
    pub scale: f32,
    pub zero_point: i32,
}

impl OperandInfo {
    pub fn from_operand(operand: &Operand) -> Self {
        Self {
            ty: Some(operand.ty),
            dimensions: operand.dimensions.clone(),
            scale: operand.scale,
            zero_point: operand.zero_point,
        }
    }
}

/// Mutable per-buffer description: logical size, current shape, associated
/// operand type and quantization.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    pub logical_size: usize,
    pub dimensions: Dimensions,
    pub ty: Option<OperandType>,
    pub scale: f32,
    pub zero_point: i32,
}

impl Metadata {
    pub fn from_operand(operand: &OperandInfo, logical_size: usize) -> Self {
        Self {
            logical_size,
            dimensions: operand.dimensions.clone(),
            ty: operand.ty,
            scale: operand.scale,
            zero_point: operand.zero_point,
        }
    }

    /// Merges `other` into self, rejecting incompatible type, scale,
    /// zero-point, or shape combinations.
    pub fn merge(&self, other: &Metadata) -> Option<Metadata> {
        if self.logical_size != 0 && other.logical_size != 0 && self.logical_size != other.logical_size
        {
            return None;
        }
        if let (Some(a), Some(b)) = (self.ty, other.ty) {
            if a != b || self.scale != other.scale || self.zero_point != other.zero_point {
                return None;
            }
        }
        let dimensions = combine_dimensions(&self.dimensions, &other.dimensions)?;
        let known = if self.ty.is_some() { self } else { other };
        Some(Metadata {
            logical_size: self.logical_size.max(other.logical_size),
            dimensions,
            ty: known.ty,
            scale: known.scale,
            zero_point: known.zero_point,
        })
    }
}

/// Per-buffer usage rules. Exactly one validator is attached to each memory
/// object; the kind depends on how the memory was allocated.
pub trait MemoryValidator: Send {
    /// Whether a use of `(offset, length)` as `role` for `operand` is legal.
    fn validate(&self, role: IoRole, operand: &OperandInfo, offset: u32, length: u32) -> bool;

    fn metadata(&self) -> Metadata;

    /// Refines the stored metadata; false when `updated` conflicts with what
    /// is already known.
    fn update_metadata(&mut self, updated: &Metadata) -> bool;

    fn is_initialized(&self) -> bool;

    fn set_initialized(&mut self, initialized: bool);
}

/// Validator for caller-supplied fixed-size buffers: any in-bounds, non-empty
/// range is fair game.
pub struct SizedValidator {
    metadata: Metadata,
    initialized: bool,
}

impl SizedValidator {
    pub fn new(size: usize) -> Self {
        Self {
            metadata: Metadata {
                logical_size: size,
                ..Default::default()
            },
            initialized: false,
        }
    }
}

impl MemoryValidator for SizedValidator {
    fn validate(&self, role: IoRole, _operand: &OperandInfo, offset: u32, length: u32) -> bool {
        if length == 0 {
            warn!("zero-length use of a sized buffer");
            return false;
        }
        let end = match offset.checked_add(length) {
            Some(end) => end as usize,
            None => return false,
        };
        if end > self.metadata.logical_size {
            warn!(
                offset,
                length,
                size = self.metadata.logical_size,
                "buffer range out of bounds"
            );
            return false;
        }
        if role == IoRole::Input && !self.initialized {
            warn!("uninitialized buffer used as execution input");
            return false;
        }
        true
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn update_metadata(&mut self, updated: &Metadata) -> bool {
        match self.metadata.merge(updated) {
            Some(merged) => {
                self.metadata = merged;
                true
            }
            None => false,
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }
}

/// Validator for backend-opaque buffers: whole-buffer use only, and only in a
/// role compatible with one declared when the buffer was allocated.
pub struct DeviceValidator {
    metadata: Metadata,
    input_roles: Vec<OperandInfo>,
    output_roles: Vec<OperandInfo>,
    initialized: bool,
}

impl DeviceValidator {
    pub fn new(
        metadata: Metadata,
        input_roles: Vec<OperandInfo>,
        output_roles: Vec<OperandInfo>,
    ) -> Self {
        Self {
            metadata,
            input_roles,
            output_roles,
            initialized: false,
        }
    }

    fn role_matches(declared: &[OperandInfo], operand: &OperandInfo) -> bool {
        declared.iter().any(|d| {
            d.ty == operand.ty
                && d.scale == operand.scale
                && d.zero_point == operand.zero_point
                && combine_dimensions(&d.dimensions, &operand.dimensions).is_some()
        })
    }
}

impl MemoryValidator for DeviceValidator {
    fn validate(&self, role: IoRole, operand: &OperandInfo, offset: u32, length: u32) -> bool {
        if offset != 0 || length != 0 {
            warn!(offset, length, "device buffers must be used whole");
            return false;
        }
        let declared = match role {
            IoRole::Input => &self.input_roles,
            IoRole::Output => &self.output_roles,
        };
        if !Self::role_matches(declared, operand) {
            warn!(?role, "use does not match any declared buffer role");
            return false;
        }
        if role == IoRole::Input && !self.initialized {
            warn!("uninitialized device buffer used as execution input");
            return false;
        }
        true
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn update_metadata(&mut self, updated: &Metadata) -> bool {
        match self.metadata.merge(updated) {
            Some(merged) => {
                self.metadata = merged;
                true
            }
            None => false,
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }
}

/// Validator for foreign, non-mappable buffers: whole-buffer execution use
/// only, never a copy source or destination.
#[derive(Default)]
pub struct ForeignValidator {
    metadata: Metadata,
    initialized: bool,
}

impl ForeignValidator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryValidator for ForeignValidator {
    fn validate(&self, role: IoRole, _operand: &OperandInfo, offset: u32, length: u32) -> bool {
        if offset != 0 || length != 0 {
            return false;
        }
        if role == IoRole::Input && !self.initialized {
            return false;
        }
        true
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn update_metadata(&mut self, _updated: &Metadata) -> bool {
        // Nothing is known about a foreign buffer, so nothing can be refined.
        false
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }
}

/// Derives the byte size a shared allocation needs for `operand` with the
/// given refined dimensions. None when the size cannot be computed.
pub fn required_size(operand: &OperandInfo, dimensions: &Dimensions) -> Option<usize> {
    let ty = operand.ty?;
    let combined = combine_dimensions(&operand.dimensions, dimensions)?;
    operand_byte_size(ty, &combined)
}
