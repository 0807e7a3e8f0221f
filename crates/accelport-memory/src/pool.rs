use accelport_core::{Dimensions, ErrorStatus, RequestArgument};
use tracing::warn;

use crate::{required_size, Memory, MemoryObject, Metadata, OperandInfo};

/// One entry in a request's pool table.
#[derive(Clone, Debug)]
pub enum RequestPool {
    /// A shared buffer owned by this process.
    Memory(Memory),
    /// A backend-opaque buffer referenced by its driver token.
    DeviceToken(u32),
}

impl RequestPool {
    pub fn as_memory(&self) -> Option<&Memory> {
        match self {
            RequestPool::Memory(m) => Some(m),
            RequestPool::DeviceToken(_) => None,
        }
    }
}

/// An execution request: argument descriptors plus the buffers they index.
#[derive(Clone, Debug, Default)]
pub struct Request {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
    pub pools: Vec<RequestPool>,
}

/// Caller-declared shape hint for `allocate`.
#[derive(Clone, Debug, Default)]
pub struct BufferDesc {
    pub dimensions: Dimensions,
}

/// One declared usage of a to-be-allocated buffer against a prepared model's
/// I/O. `frequency` is the expected fraction of executions touching the
/// buffer, in (0.0, 1.0].
#[derive(Clone, Debug)]
pub struct BufferRole {
    pub prepared_model: usize,
    pub io_index: u32,
    pub frequency: f32,
}

impl BufferRole {
    pub fn is_valid(&self) -> bool {
        self.frequency > 0.0 && self.frequency <= 1.0
    }
}

/// Combines the operand metadata behind every declared role with the caller's
/// descriptor. All roles must agree on type and quantization; dimensions are
/// progressively refined.
pub fn combine_role_operands(
    desc: &BufferDesc,
    role_operands: &[OperandInfo],
) -> Result<OperandInfo, ErrorStatus> {
    let mut combined = match role_operands.first() {
        Some(first) => first.clone(),
        None => {
            warn!("allocation declared no roles");
            return Err(ErrorStatus::InvalidArgument);
        }
    };
    for operand in &role_operands[1..] {
        if operand.ty != combined.ty
            || operand.scale != combined.scale
            || operand.zero_point != combined.zero_point
        {
            warn!("buffer roles disagree on operand type or quantization");
            return Err(ErrorStatus::InvalidArgument);
        }
        combined.dimensions =
            accelport_core::combine_dimensions(&combined.dimensions, &operand.dimensions)
                .ok_or(ErrorStatus::InvalidArgument)?;
    }
    combined.dimensions =
        accelport_core::combine_dimensions(&combined.dimensions, &desc.dimensions)
            .ok_or(ErrorStatus::InvalidArgument)?;
    Ok(combined)
}

/// Generic fallback allocation: a CPU-mappable shared region sized from the
/// combined operand metadata. Used when the roles span multiple backends or
/// the owning backend refused to allocate.
pub fn allocate_shared_fallback(
    desc: &BufferDesc,
    role_operands: &[OperandInfo],
) -> Result<Memory, ErrorStatus> {
    let combined = combine_role_operands(desc, role_operands)?;
    let size = required_size(&combined, &desc.dimensions).ok_or_else(|| {
        warn!("cannot size a shared allocation from partially unknown dimensions");
        ErrorStatus::ResourceExhaustedPersistent
    })?;
    let memory = MemoryObject::new_shared(size);
    let metadata = Metadata::from_operand(&combined, size);
    if !memory.validator().update_metadata(&metadata) {
        return Err(ErrorStatus::GeneralFailure);
    }
    Ok(memory)
}
