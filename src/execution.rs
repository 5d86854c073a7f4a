use crate::expr::SymExpr;
use crate::object::ObjectTracker;
use crate::path::SymbolicPath;
use crate::value::{CType, Location, Value};

/// Declaration-site metadata of one symbolic input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputVar {
    pub name: String,
    pub ty: CType,
    pub location: Location,
    /// Raw storage value before the input was written; only meaningful for
    /// bitfields, where it supplies the bits outside `[l, h)`.
    pub old_value: u64,
    pub h: u8,
    pub l: u8,
    pub index_size: u8,
    /// What the input's storage held symbolically when it was declared.
    pub expr: SymExpr,
}

impl InputVar {
    /// Mask selecting the field window `[l, h)` of a bitfield's storage.
    pub fn field_mask(&self) -> u64 {
        bit_window(self.l, self.h)
    }
}

pub fn bit_window(l: u8, h: u8) -> u64 {
    let upper = if h >= 64 { u64::MAX } else { (1u64 << h) - 1 };
    let lower = if l >= 64 { u64::MAX } else { (1u64 << l) - 1 };
    upper & !lower
}

#[derive(Debug, Clone, Default)]
pub struct SymbolicExecution {
    vars: Vec<InputVar>,
    inputs: Vec<Value>,
    tracker: ObjectTracker,
    path: SymbolicPath,
}

impl SymbolicExecution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run whose first inputs take the given concrete values.
    pub fn with_inputs(inputs: Vec<Value>) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    pub fn from_parts(
        vars: Vec<InputVar>,
        inputs: Vec<Value>,
        tracker: ObjectTracker,
        path: SymbolicPath,
    ) -> Self {
        Self {
            vars,
            inputs,
            tracker,
            path,
        }
    }

    pub fn vars(&self) -> &[InputVar] {
        &self.vars
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn var_names(&self) -> Vec<String> {
        self.vars.iter().map(|v| v.name.clone()).collect()
    }

    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ObjectTracker {
        &mut self.tracker
    }

    pub fn path(&self) -> &SymbolicPath {
        &self.path
    }

    pub fn path_mut(&mut self) -> &mut SymbolicPath {
        &mut self.path
    }

    /// Concrete value supplied for input `idx` by the input file, if any.
    pub fn supplied_input(&self, idx: usize) -> Option<Value> {
        self.inputs.get(idx).copied()
    }

    /// Register the next input variable together with the value it takes.
    pub fn push_var(&mut self, var: InputVar, value: Value) -> usize {
        let idx = self.vars.len();
        self.vars.push(var);
        if idx < self.inputs.len() {
            self.inputs[idx] = value;
        } else {
            self.inputs.push(value);
        }
        idx
    }
}
