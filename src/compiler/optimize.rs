use crate::bytecode::Op;

/// A pass over one function's instruction list, run after every body has
/// been generated. Jump targets are absolute indices, so a pass that removes
/// or inserts instructions must rewrite them.
pub trait Optimizer {
    fn optimize(&self, ops: Vec<Op>) -> Vec<Op>;
}

/// Leaves the instruction list untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOptimizer;

impl Optimizer for DefaultOptimizer {
    fn optimize(&self, ops: Vec<Op>) -> Vec<Op> {
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Mnemonic;

    #[test]
    fn default_is_identity() {
        let ops = vec![
            Op::new(Mnemonic::PushI, 4),
            Op::bare(Mnemonic::Retn),
        ];
        assert_eq!(DefaultOptimizer.optimize(ops.clone()), ops);
    }
}
