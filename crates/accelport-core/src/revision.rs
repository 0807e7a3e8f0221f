use crate::{Model, OperandType, OperationCode};

/// A discrete, ordered revision of the abstract driver interface. Newer
/// revisions are supersets of older ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Revision {
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

impl Revision {
    pub const LATEST: Revision = Revision::V1_3;

    /// All revisions, newest first. Connect-time probing walks this order.
    pub fn all_newest_first() -> [Revision; 4] {
        [Revision::V1_3, Revision::V1_2, Revision::V1_1, Revision::V1_0]
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Revision::V1_0 => write!(f, "1.0"),
            Revision::V1_1 => write!(f, "1.1"),
            Revision::V1_2 => write!(f, "1.2"),
            Revision::V1_3 => write!(f, "1.3"),
        }
    }
}

impl OperandType {
    pub fn min_revision(self) -> Revision {
        match self {
            OperandType::Float32
            | OperandType::Int32
            | OperandType::UInt32
            | OperandType::TensorFloat32
            | OperandType::TensorInt32
            | OperandType::TensorQuant8Asymm => Revision::V1_0,
            OperandType::Bool
            | OperandType::TensorQuant16Symm
            | OperandType::TensorFloat16
            | OperandType::TensorBool8
            | OperandType::Float16
            | OperandType::TensorQuant8SymmPerChannel
            | OperandType::TensorQuant16Asymm
            | OperandType::TensorQuant8Symm
            | OperandType::Extension(_) => Revision::V1_2,
            OperandType::TensorQuant8AsymmSigned | OperandType::Subgraph => Revision::V1_3,
        }
    }
}

impl OperationCode {
    pub fn min_revision(self) -> Revision {
        match self {
            OperationCode::Add
            | OperationCode::Conv2d
            | OperationCode::FullyConnected
            | OperationCode::Mul
            | OperationCode::Softmax => Revision::V1_0,
            OperationCode::Div
            | OperationCode::Mean
            | OperationCode::Sub
            | OperationCode::Transpose => Revision::V1_1,
            OperationCode::Equal
            | OperationCode::Gather
            | OperationCode::Maximum
            | OperationCode::Minimum
            | OperationCode::ResizeNearestNeighbor
            | OperationCode::Extension(_) => Revision::V1_2,
            OperationCode::Fill
            | OperationCode::Rank
            | OperationCode::HardSwish
            | OperationCode::If
            | OperationCode::While => Revision::V1_3,
        }
    }
}

impl Model {
    /// True when operation `op_index` (its code and every operand it touches)
    /// is expressible at `rev`.
    pub fn operation_compliant_with(&self, op_index: usize, rev: Revision) -> bool {
        let operation = &self.operations[op_index];
        if operation.code.min_revision() > rev {
            return false;
        }
        operation
            .inputs
            .iter()
            .chain(operation.outputs.iter())
            .all(|&idx| self.operands[idx as usize].ty.min_revision() <= rev)
    }

    /// True when the whole model can be handed to a driver at `rev` without
    /// slicing or information loss.
    pub fn compliant_with(&self, rev: Revision) -> bool {
        if self.relaxed_float32_to_float16 && rev < Revision::V1_1 {
            return false;
        }
        (0..self.operations.len()).all(|i| self.operation_compliant_with(i, rev))
            && self
                .operands
                .iter()
                .all(|operand| operand.ty.min_revision() <= rev)
    }
}
