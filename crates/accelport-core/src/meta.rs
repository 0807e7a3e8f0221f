use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{
    Model, Operand, OperandLifetime, OperandSignature, Operation, Revision,
};

/// A sub-graph of a model containing only the operations expressible at one
/// target revision, plus the mapping from slice operation indices back to the
/// original graph.
#[derive(Clone, Debug)]
pub struct Slice {
    pub model: Model,
    /// `op_index_map[sliced_op_index] == original_op_index`.
    pub op_index_map: Vec<u32>,
}

/// Wraps a model with lazily computed, per-revision slices. Slices are cached
/// for the lifetime of the wrapper; the same model and revision always yield
/// the same slice.
pub struct MetaModel {
    model: Model,
    slices: Mutex<HashMap<Revision, Option<Arc<Slice>>>>,
}

impl MetaModel {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            slices: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The maximal sub-graph expressible at `rev`, or None when the slice
    /// would have zero operations or zero outputs.
    pub fn slice(&self, rev: Revision) -> Option<Arc<Slice>> {
        let mut cache = self.slices.lock().unwrap();
        cache
            .entry(rev)
            .or_insert_with(|| compute_slice(&self.model, rev).map(Arc::new))
            .clone()
    }

    /// Maps a per-sliced-operation support vector back to original operation
    /// indices; operations absent from the slice are reported unsupported.
    pub fn remap_supported(&self, slice: &Slice, supported: &[bool]) -> Vec<bool> {
        let mut remapped = vec![false; self.model.operations.len()];
        for (sliced_index, &ok) in supported.iter().enumerate() {
            if ok {
                if let Some(&orig) = slice.op_index_map.get(sliced_index) {
                    remapped[orig as usize] = true;
                }
            }
        }
        remapped
    }
}

struct SliceBuilder<'m> {
    model: &'m Model,
    operands: Vec<Operand>,
    input_indexes: Vec<u32>,
    /// Original operand index -> slice operand index.
    orig_to_slice: HashMap<u32, u32>,
    /// Promoted-input slot map, keyed by operand signature, never by value.
    promoted: HashMap<OperandSignature, u32>,
}

impl<'m> SliceBuilder<'m> {
    fn new(model: &'m Model) -> Self {
        Self {
            model,
            operands: Vec::new(),
            input_indexes: Vec::new(),
            orig_to_slice: HashMap::new(),
            promoted: HashMap::new(),
        }
    }

    /// Resolves an input of a compliant operation to a slice operand index,
    /// creating the operand on first sight.
    fn map_input(&mut self, orig_index: u32) -> u32 {
        if let Some(&idx) = self.orig_to_slice.get(&orig_index) {
            return idx;
        }
        let operand = &self.model.operands[orig_index as usize];
        match operand.lifetime {
            // Constants and omitted arguments are copied verbatim; the value
            // pools are carried over wholesale so locations stay valid.
            OperandLifetime::ConstantCopy
            | OperandLifetime::ConstantRef
            | OperandLifetime::NoValue => {
                let idx = self.operands.len() as u32;
                self.operands.push(operand.clone());
                self.orig_to_slice.insert(orig_index, idx);
                idx
            }
            // Anything else reaching here was produced outside the slice (a
            // graph input, or the output of a non-compliant operation) and is
            // promoted to a slice input, one slot per distinct signature.
            OperandLifetime::ModelInput
            | OperandLifetime::ModelOutput
            | OperandLifetime::Temporary => {
                let signature = operand.signature();
                let idx = match self.promoted.get(&signature) {
                    Some(&slot) => slot,
                    None => {
                        let slot = self.operands.len() as u32;
                        self.operands.push(Operand {
                            lifetime: OperandLifetime::ModelInput,
                            location: Default::default(),
                            ..operand.clone()
                        });
                        self.input_indexes.push(slot);
                        self.promoted.insert(signature, slot);
                        slot
                    }
                };
                self.orig_to_slice.insert(orig_index, idx);
                idx
            }
        }
    }

    fn add_output(&mut self, orig_index: u32) -> u32 {
        let operand = &self.model.operands[orig_index as usize];
        let idx = self.operands.len() as u32;
        self.operands.push(Operand {
            lifetime: OperandLifetime::Temporary,
            location: Default::default(),
            ..operand.clone()
        });
        self.orig_to_slice.insert(orig_index, idx);
        idx
    }
}

fn compute_slice(model: &Model, rev: Revision) -> Option<Slice> {
    let compliant: Vec<bool> = (0..model.operations.len())
        .map(|i| model.operation_compliant_with(i, rev))
        .collect();
    if !compliant.iter().any(|&c| c) {
        debug!(revision = %rev, "slice has no compliant operations");
        return None;
    }

    // Remaining compliant consumers per original operand; outputs that end at
    // zero become slice outputs.
    let mut consumers = vec![0u32; model.operands.len()];
    for (op_index, operation) in model.operations.iter().enumerate() {
        if compliant[op_index] {
            for &input in &operation.inputs {
                consumers[input as usize] += 1;
            }
        }
    }

    let mut builder = SliceBuilder::new(model);
    let mut operations = Vec::new();
    let mut op_index_map = Vec::new();
    let mut emitted_outputs: Vec<u32> = Vec::new();

    for (op_index, operation) in model.operations.iter().enumerate() {
        if !compliant[op_index] {
            continue;
        }
        let inputs: Vec<u32> = operation
            .inputs
            .iter()
            .map(|&idx| builder.map_input(idx))
            .collect();
        let outputs: Vec<u32> = operation
            .outputs
            .iter()
            .map(|&idx| {
                emitted_outputs.push(idx);
                builder.add_output(idx)
            })
            .collect();
        operations.push(Operation {
            code: operation.code,
            inputs,
            outputs,
        });
        op_index_map.push(op_index as u32);
    }

    let mut output_indexes = Vec::new();
    for &orig_index in &emitted_outputs {
        if consumers[orig_index as usize] == 0 {
            let slice_index = builder.orig_to_slice[&orig_index];
            builder.operands[slice_index as usize].lifetime = OperandLifetime::ModelOutput;
            output_indexes.push(slice_index);
        }
    }
    if output_indexes.is_empty() {
        debug!(revision = %rev, "slice has no outputs");
        return None;
    }

    let sliced = Model {
        operands: builder.operands,
        operations,
        input_indexes: builder.input_indexes,
        output_indexes,
        operand_values: model.operand_values.clone(),
        pools: model.pools.clone(),
        relaxed_float32_to_float16: model.relaxed_float32_to_float16 && rev >= Revision::V1_1,
    };
    debug!(
        revision = %rev,
        operations = sliced.operations.len(),
        inputs = sliced.input_indexes.len(),
        outputs = sliced.output_indexes.len(),
        "computed model slice"
    );
    Some(Slice {
        model: sliced,
        op_index_map,
    })
}
