use std::sync::Arc;

use accelport_core::ErrorStatus;
use accelport_memory::{
    allocate_shared_fallback, BufferDesc, BufferRole, Memory, OperandInfo,
};
use tracing::{debug, warn};

use crate::VersionedPreparedModel;

fn resolve_roles(
    prepared: &[Arc<VersionedPreparedModel>],
    roles: &[BufferRole],
    pick: impl Fn(&VersionedPreparedModel, usize) -> Option<OperandInfo>,
) -> Option<Vec<OperandInfo>> {
    let mut operands = Vec::with_capacity(roles.len());
    for role in roles {
        if !role.is_valid() {
            return None;
        }
        let model = prepared.get(role.prepared_model)?;
        operands.push(pick(model, role.io_index as usize)?);
    }
    Some(operands)
}

/// All referenced prepared models living on the same live device, if any.
fn common_device(
    prepared: &[Arc<VersionedPreparedModel>],
    roles: impl Iterator<Item = usize>,
) -> Option<Arc<crate::VersionedDevice>> {
    let mut device = None;
    for index in roles {
        let candidate = prepared.get(index)?.device()?;
        match &device {
            None => device = Some(candidate),
            Some(held) if Arc::ptr_eq(held, &candidate) => {}
            Some(_) => return None,
        }
    }
    device
}

/// Allocates a buffer usable in the given roles. When every role targets the
/// same device the driver gets first refusal; otherwise, or when the driver
/// declines, a generic shared buffer sized from the merged operand metadata
/// is handed back.
pub async fn allocate_memory(
    desc: &BufferDesc,
    prepared: &[Arc<VersionedPreparedModel>],
    input_roles: &[BufferRole],
    output_roles: &[BufferRole],
) -> (ErrorStatus, Option<Memory>) {
    if input_roles.is_empty() && output_roles.is_empty() {
        return (ErrorStatus::InvalidArgument, None);
    }
    let input_operands = match resolve_roles(prepared, input_roles, |model, index| {
        model.input_info(index).cloned()
    }) {
        Some(operands) => operands,
        None => return (ErrorStatus::InvalidArgument, None),
    };
    let output_operands = match resolve_roles(prepared, output_roles, |model, index| {
        model.output_info(index).cloned()
    }) {
        Some(operands) => operands,
        None => return (ErrorStatus::InvalidArgument, None),
    };

    let role_models = input_roles
        .iter()
        .chain(output_roles.iter())
        .map(|role| role.prepared_model);
    if let Some(device) = common_device(prepared, role_models) {
        let (status, memory) = device
            .allocate_device_memory(desc, &input_operands, &output_operands)
            .await;
        if status == ErrorStatus::None && memory.is_some() {
            return (status, memory);
        }
        debug!(device = %device.name(), ?status, "falling back to shared allocation");
    }

    let mut all_operands = input_operands;
    all_operands.extend(output_operands);
    match allocate_shared_fallback(desc, &all_operands) {
        Ok(memory) => (ErrorStatus::None, Some(memory)),
        Err(status) => {
            warn!(?status, "shared fallback allocation failed");
            (status, None)
        }
    }
}
