use std::sync::Arc;

use accelport_core::{
    Dimensions, MetaModel, Model, Operand, OperandLifetime, OperandType, Operation, OperationCode,
    Revision,
};

fn tensor(lifetime: OperandLifetime, dims: &[u32]) -> Operand {
    Operand {
        ty: OperandType::TensorFloat32,
        dimensions: Dimensions::from_slice(dims),
        scale: 0.0,
        zero_point: 0,
        lifetime,
        location: Default::default(),
        extra_params: None,
    }
}

/// Add (1.0) feeding HardSwish (1.3): only the Add survives a 1.0 slice.
fn mixed_revision_model() -> Model {
    Model {
        operands: vec![
            tensor(OperandLifetime::ModelInput, &[1, 4]),
            tensor(OperandLifetime::ModelInput, &[1, 8]),
            tensor(OperandLifetime::Temporary, &[1, 4]),
            tensor(OperandLifetime::ModelOutput, &[1, 4]),
        ],
        operations: vec![
            Operation {
                code: OperationCode::Add,
                inputs: vec![0, 1],
                outputs: vec![2],
            },
            Operation {
                code: OperationCode::HardSwish,
                inputs: vec![2],
                outputs: vec![3],
            },
        ],
        input_indexes: vec![0, 1],
        output_indexes: vec![3],
        ..Default::default()
    }
}

#[test]
fn full_model_compliance_tracks_newest_operation() {
    let model = mixed_revision_model();
    assert!(model.compliant_with(Revision::V1_3));
    assert!(!model.compliant_with(Revision::V1_2));
    assert!(!model.compliant_with(Revision::V1_0));
    assert!(model.operation_compliant_with(0, Revision::V1_0));
    assert!(!model.operation_compliant_with(1, Revision::V1_0));
}

#[test]
fn slice_keeps_only_compliant_operations() {
    let meta = MetaModel::new(mixed_revision_model());
    let slice = meta.slice(Revision::V1_0).expect("slice must exist");

    assert_eq!(slice.model.operations.len(), 1);
    assert_eq!(slice.op_index_map, vec![0]);
    slice.model.validate().expect("slice must be a valid model");

    // The Add's output has no compliant consumer, so it becomes the slice's
    // output.
    assert_eq!(slice.model.output_indexes.len(), 1);
    let out = &slice.model.operands[slice.model.output_indexes[0] as usize];
    assert_eq!(out.lifetime, OperandLifetime::ModelOutput);
}

#[test]
fn slice_is_cached_and_deterministic() {
    let meta = MetaModel::new(mixed_revision_model());
    let first = meta.slice(Revision::V1_0).unwrap();
    let second = meta.slice(Revision::V1_0).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // An independent wrapper over the same graph produces the same slice.
    let other = MetaModel::new(mixed_revision_model());
    let fresh = other.slice(Revision::V1_0).unwrap();
    assert_eq!(fresh.op_index_map, first.op_index_map);
    assert_eq!(
        fresh.model.operations.len(),
        first.model.operations.len()
    );
    assert_eq!(
        fresh.model.input_indexes.len(),
        first.model.input_indexes.len()
    );
}

#[test]
fn promoted_inputs_share_a_slot_per_signature() {
    // Both Add inputs carry the same type, shape, and quantization; promoting
    // them must reuse one slice input slot.
    let mut model = mixed_revision_model();
    model.operands[1] = tensor(OperandLifetime::ModelInput, &[1, 4]);

    let meta = MetaModel::new(model);
    let slice = meta.slice(Revision::V1_0).unwrap();
    assert_eq!(slice.model.input_indexes.len(), 1);

    let op = &slice.model.operations[0];
    assert_eq!(op.inputs[0], op.inputs[1]);
}

#[test]
fn distinct_signatures_get_distinct_slots() {
    let meta = MetaModel::new(mixed_revision_model());
    let slice = meta.slice(Revision::V1_0).unwrap();
    // [1,4] and [1,8] differ, so two promoted inputs.
    assert_eq!(slice.model.input_indexes.len(), 2);
}

#[test]
fn slice_absent_when_nothing_is_compliant() {
    let model = Model {
        operands: vec![
            tensor(OperandLifetime::ModelInput, &[2]),
            tensor(OperandLifetime::ModelOutput, &[2]),
        ],
        operations: vec![Operation {
            code: OperationCode::HardSwish,
            inputs: vec![0],
            outputs: vec![1],
        }],
        input_indexes: vec![0],
        output_indexes: vec![1],
        ..Default::default()
    };
    let meta = MetaModel::new(model);
    assert!(meta.slice(Revision::V1_0).is_none());
    assert!(meta.slice(Revision::V1_2).is_none());
    assert!(meta.slice(Revision::V1_3).is_some());
}

#[test]
fn remap_reports_sliced_support_at_original_indices() {
    let meta = MetaModel::new(mixed_revision_model());
    let slice = meta.slice(Revision::V1_0).unwrap();

    let remapped = meta.remap_supported(&slice, &[true]);
    assert_eq!(remapped, vec![true, false]);

    let remapped = meta.remap_supported(&slice, &[false]);
    assert_eq!(remapped, vec![false, false]);
}

#[test]
fn relaxed_precision_needs_v1_1() {
    let mut model = mixed_revision_model();
    model.operations.pop();
    model.operands[3].lifetime = OperandLifetime::Temporary;
    model.output_indexes = vec![2];
    model.operands[2].lifetime = OperandLifetime::ModelOutput;
    model.relaxed_float32_to_float16 = true;

    assert!(!model.compliant_with(Revision::V1_0));
    assert!(model.compliant_with(Revision::V1_1));
}
