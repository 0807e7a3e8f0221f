use anyhow::{ensure, Result};
use bytes::Bytes;

use crate::{Dimensions, ExtraParams, OperandType};

/// Where an operand's data lives for the lifetime of the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandLifetime {
    /// Constant stored in `Model::operand_values`.
    ConstantCopy,
    /// Constant stored in one of `Model::pools`.
    ConstantRef,
    ModelInput,
    ModelOutput,
    Temporary,
    /// Omitted optional argument.
    NoValue,
}

/// Byte range within a value pool. `pool` indexes `Model::pools` for
/// ConstantRef operands and is 0 for ConstantCopy (the small-values pool).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataLocation {
    pub pool: u32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, Debug)]
pub struct Operand {
    pub ty: OperandType,
    pub dimensions: Dimensions,
    pub scale: f32,
    pub zero_point: i32,
    pub lifetime: OperandLifetime,
    pub location: DataLocation,
    pub extra_params: Option<ExtraParams>,
}

impl Operand {
    /// The identity of an operand for slicing purposes: everything except its
    /// lifetime, location, and value.
    pub fn signature(&self) -> OperandSignature {
        OperandSignature {
            ty: self.ty,
            dimensions: self.dimensions.clone(),
            scale_bits: self.scale.to_bits(),
            zero_point: self.zero_point,
            extra_params: self.extra_params.clone().map(ExtraParamsKey::from),
        }
    }
}

/// Hashable operand identity key. Scale is keyed by bit pattern so that the
/// map never depends on float equality quirks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperandSignature {
    pub ty: OperandType,
    pub dimensions: Dimensions,
    pub scale_bits: u32,
    pub zero_point: i32,
    pub extra_params: Option<ExtraParamsKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExtraParamsKey {
    ChannelQuant { scale_bits: Vec<u32>, channel_dim: u32 },
    Extension(Vec<u8>),
}

impl From<ExtraParams> for ExtraParamsKey {
    fn from(p: ExtraParams) -> Self {
        match p {
            ExtraParams::ChannelQuant(q) => ExtraParamsKey::ChannelQuant {
                scale_bits: q.scales.iter().map(|s| s.to_bits()).collect(),
                channel_dim: q.channel_dim,
            },
            ExtraParams::Extension(raw) => ExtraParamsKey::Extension(raw),
        }
    }
}

/// Graph operation codes, a representative versioned subset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationCode {
    Add,
    Conv2d,
    FullyConnected,
    Mul,
    Softmax,
    Div,
    Mean,
    Sub,
    Transpose,
    Equal,
    Gather,
    Maximum,
    Minimum,
    ResizeNearestNeighbor,
    Fill,
    Rank,
    HardSwish,
    If,
    While,
    Extension(u32),
}

#[derive(Clone, Debug)]
pub struct Operation {
    pub code: OperationCode,
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
}

/// A computation graph: operands plus operations in topological order.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub operands: Vec<Operand>,
    pub operations: Vec<Operation>,
    pub input_indexes: Vec<u32>,
    pub output_indexes: Vec<u32>,
    /// Small-constant pool for ConstantCopy operands.
    pub operand_values: Bytes,
    /// Large-constant pools for ConstantRef operands.
    pub pools: Vec<Bytes>,
    pub relaxed_float32_to_float16: bool,
}

impl Model {
    /// Checks the topological-order invariant: every operation input is
    /// defined (by a prior operation, a graph input, or a constant) before
    /// the operation appears, and all indices are in range.
    pub fn validate(&self) -> Result<()> {
        let num_operands = self.operands.len() as u32;
        let mut defined = vec![false; self.operands.len()];

        for (i, operand) in self.operands.iter().enumerate() {
            match operand.lifetime {
                OperandLifetime::ConstantCopy
                | OperandLifetime::ConstantRef
                | OperandLifetime::ModelInput
                | OperandLifetime::NoValue => defined[i] = true,
                OperandLifetime::ModelOutput | OperandLifetime::Temporary => {}
            }
        }
        for &idx in &self.input_indexes {
            ensure!(idx < num_operands, "model input index {idx} out of range");
        }
        for &idx in &self.output_indexes {
            ensure!(idx < num_operands, "model output index {idx} out of range");
        }

        for (op_index, operation) in self.operations.iter().enumerate() {
            for &input in &operation.inputs {
                ensure!(
                    input < num_operands,
                    "operation {op_index} input {input} out of range"
                );
                ensure!(
                    defined[input as usize],
                    "operation {op_index} reads operand {input} before it is defined"
                );
            }
            for &output in &operation.outputs {
                ensure!(
                    output < num_operands,
                    "operation {op_index} output {output} out of range"
                );
                defined[output as usize] = true;
            }
        }

        for &idx in &self.output_indexes {
            ensure!(
                defined[idx as usize],
                "model output {idx} is never produced"
            );
        }
        Ok(())
    }

    /// Raw bytes for a constant operand, or None for non-constant lifetimes
    /// or a location that does not resolve.
    pub fn operand_value(&self, operand: &Operand) -> Option<&[u8]> {
        let loc = operand.location;
        let end = loc.offset.checked_add(loc.length)?;
        let range = loc.offset as usize..end as usize;
        match operand.lifetime {
            OperandLifetime::ConstantCopy => self.operand_values.get(range),
            OperandLifetime::ConstantRef => self.pools.get(loc.pool as usize)?.get(range),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dimensions;

    fn operand(lifetime: OperandLifetime) -> Operand {
        Operand {
            ty: crate::OperandType::TensorFloat32,
            dimensions: Dimensions::from_slice(&[2]),
            scale: 0.0,
            zero_point: 0,
            lifetime,
            location: DataLocation::default(),
            extra_params: None,
        }
    }

    fn add_model() -> Model {
        Model {
            operands: vec![
                operand(OperandLifetime::ModelInput),
                operand(OperandLifetime::ModelInput),
                operand(OperandLifetime::ModelOutput),
            ],
            operations: vec![Operation {
                code: OperationCode::Add,
                inputs: vec![0, 1],
                outputs: vec![2],
            }],
            input_indexes: vec![0, 1],
            output_indexes: vec![2],
            ..Default::default()
        }
    }

    #[test]
    fn valid_model_passes() {
        add_model().validate().unwrap();
    }

    #[test]
    fn use_before_definition_is_rejected() {
        let mut model = add_model();
        model.operands[1].lifetime = OperandLifetime::Temporary;
        assert!(model.validate().is_err());
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut model = add_model();
        model.operations[0].inputs[0] = 9;
        assert!(model.validate().is_err());

        let mut model = add_model();
        model.output_indexes = vec![9];
        assert!(model.validate().is_err());
    }

    #[test]
    fn unproduced_output_is_rejected() {
        let mut model = add_model();
        model.operations.clear();
        assert!(model.validate().is_err());
    }

    #[test]
    fn constant_values_resolve_by_location() {
        let mut model = add_model();
        model.operand_values = bytes::Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);
        model.operands[1].lifetime = OperandLifetime::ConstantCopy;
        model.operands[1].location = DataLocation {
            pool: 0,
            offset: 4,
            length: 4,
        };
        let value = model.operand_value(&model.operands[1]).unwrap();
        assert_eq!(value, &[5, 6, 7, 8]);
        assert!(model.operand_value(&model.operands[0]).is_none());

        // A location whose end does not fit in u32 resolves to nothing.
        model.operands[1].location = DataLocation {
            pool: 0,
            offset: u32::MAX,
            length: 2,
        };
        assert!(model.operand_value(&model.operands[1]).is_none());
    }

    #[test]
    fn signatures_ignore_lifetime_and_location() {
        let a = operand(OperandLifetime::ModelInput);
        let mut b = operand(OperandLifetime::Temporary);
        b.location = DataLocation {
            pool: 1,
            offset: 8,
            length: 8,
        };
        assert_eq!(a.signature(), b.signature());

        let mut c = operand(OperandLifetime::ModelInput);
        c.scale = 0.5;
        assert_ne!(a.signature(), c.signature());
    }
}
