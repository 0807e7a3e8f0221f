use smallvec::SmallVec;

/// Operand element types. Scalar types carry a single value; tensor types
/// carry `numel` elements laid out densely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperandType {
    Float32,
    Int32,
    UInt32,
    TensorFloat32,
    TensorInt32,
    TensorQuant8Asymm,
    Bool,
    TensorQuant16Symm,
    TensorFloat16,
    TensorBool8,
    Float16,
    TensorQuant8SymmPerChannel,
    TensorQuant16Asymm,
    TensorQuant8Symm,
    TensorQuant8AsymmSigned,
    Subgraph,
    /// Vendor extension type; the low bits are the extension-local type code.
    Extension(u32),
}

impl OperandType {
    pub fn is_tensor(self) -> bool {
        !matches!(
            self,
            OperandType::Float32
                | OperandType::Int32
                | OperandType::UInt32
                | OperandType::Bool
                | OperandType::Float16
                | OperandType::Subgraph
        )
    }

    /// Bytes per element, or None for types whose size is not known to the
    /// runtime (extensions).
    pub fn element_size(self) -> Option<usize> {
        Some(match self {
            OperandType::Float32 | OperandType::TensorFloat32 => 4,
            OperandType::Int32 | OperandType::TensorInt32 => 4,
            OperandType::UInt32 => 4,
            OperandType::TensorQuant8Asymm
            | OperandType::TensorQuant8Symm
            | OperandType::TensorQuant8SymmPerChannel
            | OperandType::TensorQuant8AsymmSigned
            | OperandType::TensorBool8
            | OperandType::Bool => 1,
            OperandType::TensorQuant16Symm | OperandType::TensorQuant16Asymm => 2,
            OperandType::Float16 | OperandType::TensorFloat16 => 2,
            OperandType::Subgraph => return None,
            OperandType::Extension(_) => return None,
        })
    }
}

/// Tensor dimensions. A dimension of 0 means "unknown at this point"; shapes
/// are refined by the first successful use.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Dimensions(pub SmallVec<[u32; 4]>);

impl Dimensions {
    pub fn from_slice(d: &[u32]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_fully_specified(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|&d| d != 0)
    }

    /// Element count, or None when any dimension is unknown. A scalar (rank 0)
    /// has one element.
    pub fn numel(&self) -> Option<usize> {
        if self.0.iter().any(|&d| d == 0) {
            return None;
        }
        Some(self.0.iter().map(|&d| d as usize).product::<usize>().max(1))
    }
}

/// Combine two partially-known dimension lists. Succeeds when they agree on
/// every dimension that both sides know; the result takes the known value
/// wherever either side has one.
pub fn combine_dimensions(lhs: &Dimensions, rhs: &Dimensions) -> Option<Dimensions> {
    if lhs.0.is_empty() {
        return Some(rhs.clone());
    }
    if rhs.0.is_empty() {
        return Some(lhs.clone());
    }
    if lhs.rank() != rhs.rank() {
        return None;
    }
    let mut combined = SmallVec::with_capacity(lhs.rank());
    for (&a, &b) in lhs.0.iter().zip(rhs.0.iter()) {
        if a != 0 && b != 0 && a != b {
            return None;
        }
        combined.push(if a != 0 { a } else { b });
    }
    Some(Dimensions(combined))
}

/// Byte size of an operand of `ty` with `dimensions`, or None when the size
/// cannot be derived (unknown dims or extension type).
pub fn operand_byte_size(ty: OperandType, dimensions: &Dimensions) -> Option<usize> {
    let element = ty.element_size()?;
    if ty.is_tensor() {
        Some(element * dimensions.numel()?)
    } else {
        Some(element)
    }
}

/// Per-channel symmetric quantization, the one structured extra-params payload
/// tensor operands may carry.
#[derive(Clone, Debug, PartialEq)]
pub struct SymmPerChannelQuantParams {
    pub scales: Vec<f32>,
    pub channel_dim: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExtraParams {
    ChannelQuant(SymmPerChannelQuantParams),
    Extension(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_refines_unknown_dimensions() {
        let partial = Dimensions::from_slice(&[0, 4]);
        let known = Dimensions::from_slice(&[2, 0]);
        let combined = combine_dimensions(&partial, &known).unwrap();
        assert_eq!(combined, Dimensions::from_slice(&[2, 4]));
    }

    #[test]
    fn combine_rejects_conflicts() {
        let a = Dimensions::from_slice(&[2, 4]);
        let b = Dimensions::from_slice(&[2, 5]);
        assert!(combine_dimensions(&a, &b).is_none());
        assert!(combine_dimensions(&a, &Dimensions::from_slice(&[2])).is_none());
    }

    #[test]
    fn empty_side_defers_to_the_other() {
        let known = Dimensions::from_slice(&[3, 3]);
        assert_eq!(
            combine_dimensions(&Dimensions::default(), &known).unwrap(),
            known
        );
    }

    #[test]
    fn byte_sizes() {
        let dims = Dimensions::from_slice(&[2, 3]);
        assert_eq!(
            operand_byte_size(OperandType::TensorFloat32, &dims),
            Some(24)
        );
        assert_eq!(
            operand_byte_size(OperandType::TensorQuant8Asymm, &dims),
            Some(6)
        );
        // Scalars ignore dimensions.
        assert_eq!(
            operand_byte_size(OperandType::Int32, &Dimensions::default()),
            Some(4)
        );
        // Unknown dims or extension types cannot be sized.
        let unknown = Dimensions::from_slice(&[0, 3]);
        assert_eq!(operand_byte_size(OperandType::TensorFloat32, &unknown), None);
        assert_eq!(operand_byte_size(OperandType::Extension(7), &dims), None);
    }
}
