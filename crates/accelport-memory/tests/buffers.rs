use std::io::{Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use accelport_core::{Dimensions, ErrorStatus, OperandType};
use accelport_memory::{
    allocate_shared_fallback, copy, BufferDesc, IoRole, MemoryObject, Metadata, OperandInfo,
};

fn float_info(dims: &[u32]) -> OperandInfo {
    OperandInfo {
        ty: Some(OperandType::TensorFloat32),
        dimensions: Dimensions::from_slice(dims),
        scale: 0.0,
        zero_point: 0,
    }
}

#[test]
fn shared_buffer_lifecycle() {
    let memory = MemoryObject::new_shared(16);
    let info = float_info(&[2, 2]);

    // Fresh buffers may be written but not yet read.
    assert!(!memory.validator().is_initialized());
    assert!(memory.validate(IoRole::Output, &info, 0, 16));
    assert!(!memory.validate(IoRole::Input, &info, 0, 16));

    memory.validator().set_initialized(true);
    assert!(memory.validate(IoRole::Input, &info, 0, 16));

    // A failed execution clears the flag again.
    memory.validator().set_initialized(false);
    assert!(!memory.validate(IoRole::Input, &info, 0, 16));
}

#[test]
fn sized_buffer_rejects_bad_ranges() {
    let memory = MemoryObject::new_shared(16);
    let info = float_info(&[2, 2]);
    assert!(!memory.validate(IoRole::Output, &info, 0, 0));
    assert!(!memory.validate(IoRole::Output, &info, 8, 16));
    assert!(!memory.validate(IoRole::Output, &info, u32::MAX, 2));
    assert!(memory.validate(IoRole::Output, &info, 8, 8));
}

#[test]
fn copy_requires_initialized_source() {
    let src = MemoryObject::new_shared(8);
    let dst = MemoryObject::new_shared(8);
    assert_eq!(copy(&src, &dst), ErrorStatus::GeneralFailure);

    src.write_all(&[7u8; 8]);
    src.validator().set_initialized(true);
    assert_eq!(copy(&src, &dst), ErrorStatus::None);
    assert!(dst.validator().is_initialized());
    assert_eq!(dst.read_all().unwrap(), vec![7u8; 8]);
}

#[test]
fn copy_rejects_size_mismatch() {
    let src = MemoryObject::new_shared(8);
    src.validator().set_initialized(true);
    let dst = MemoryObject::new_shared(4);
    assert_ne!(copy(&src, &dst), ErrorStatus::None);
    assert!(!dst.validator().is_initialized());
}

#[test]
fn copy_merges_metadata_into_destination() {
    let src = MemoryObject::new_shared(16);
    let info = float_info(&[2, 2]);
    assert!(src
        .validator()
        .update_metadata(&Metadata::from_operand(&info, 16)));
    src.validator().set_initialized(true);

    let dst = MemoryObject::new_shared(16);
    assert_eq!(copy(&src, &dst), ErrorStatus::None);
    let metadata = dst.validator().metadata();
    assert_eq!(metadata.ty, Some(OperandType::TensorFloat32));
    assert_eq!(metadata.dimensions, Dimensions::from_slice(&[2, 2]));
}

#[test]
fn fd_backed_buffer_round_trips() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&[1, 2, 3, 4]).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let memory = MemoryObject::new_from_fd(file, 4);
    assert_eq!(memory.read_all().unwrap(), vec![1, 2, 3, 4]);
    assert!(memory.write_all(&[9, 9, 9, 9]));
    assert_eq!(memory.read_all().unwrap(), vec![9, 9, 9, 9]);
    assert!(!memory.write_all(&[1, 2]));
}

#[test]
fn device_buffer_enforces_declared_roles() {
    let info = float_info(&[2, 2]);
    let other = OperandInfo {
        scale: 0.5,
        ..float_info(&[2, 2])
    };
    let staging = Arc::new(Mutex::new(vec![0u8; 16]));
    let memory = MemoryObject::new_device(
        7,
        "loopback".into(),
        Some(staging),
        Metadata::from_operand(&info, 16),
        vec![info.clone()],
        vec![info.clone()],
    );

    // Whole-buffer use only.
    assert!(!memory.validate(IoRole::Output, &info, 0, 16));
    assert!(memory.validate(IoRole::Output, &info, 0, 0));
    // Quantization must match a declared role.
    assert!(!memory.validate(IoRole::Output, &other, 0, 0));

    memory.validator().set_initialized(true);
    assert!(memory.validate(IoRole::Input, &info, 0, 0));
    assert_eq!(memory.device_token(), Some(7));
}

#[test]
fn foreign_buffer_is_execution_only() {
    let memory = MemoryObject::new_foreign();
    let info = float_info(&[2]);
    assert!(memory.validate(IoRole::Output, &info, 0, 0));
    assert!(memory.read_all().is_none());
    assert!(!memory
        .validator()
        .update_metadata(&Metadata::from_operand(&info, 8)));
}

#[test]
fn fallback_allocation_sizes_from_roles() {
    let desc = BufferDesc {
        dimensions: Dimensions::from_slice(&[2, 0]),
    };
    let roles = vec![float_info(&[0, 3]), float_info(&[2, 3])];
    let memory = allocate_shared_fallback(&desc, &roles).unwrap();
    assert_eq!(memory.size(), 24);
    let metadata = memory.validator().metadata();
    assert_eq!(metadata.dimensions, Dimensions::from_slice(&[2, 3]));
}

#[test]
fn fallback_allocation_fails_when_unsizeable() {
    let desc = BufferDesc::default();
    let roles = vec![float_info(&[0, 3])];
    assert_eq!(
        allocate_shared_fallback(&desc, &roles).unwrap_err(),
        ErrorStatus::ResourceExhaustedPersistent
    );

    let conflicting = vec![float_info(&[2, 3]), float_info(&[2, 4])];
    assert_eq!(
        allocate_shared_fallback(&desc, &conflicting).unwrap_err(),
        ErrorStatus::InvalidArgument
    );
}
