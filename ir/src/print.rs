use core::fmt;

use crate::{BlockKind, ConstantKind, Graph, OpIndex, Operation};

impl fmt::Display for ConstantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Word32(value) => write!(f, "w32 {value}"),
            Self::Word64(value) => write!(f, "w64 {value}"),
            Self::Float32(value) => write!(f, "f32 {value}"),
            Self::Float64(value) => write!(f, "f64 {value}"),
            Self::External(address) => write!(f, "external {address:#x}"),
            Self::HeapObject(handle) => write!(f, "heap {handle:#x}"),
            Self::CompressedHeapObject(handle) => write!(f, "compressed {handle:#x}"),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Merge => "merge",
            Self::Loop => "loop",
            Self::BranchTarget => "branch-target",
        })
    }
}

struct Inputs<'a>(&'a [OpIndex]);

impl fmt::Display for Inputs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, input) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{input}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Self::Constant { kind } => return write!(f, "({kind})"),
            Self::Parameter { index, rep } => return write!(f, "[{rep}]({index})"),
            Self::WordBinop { kind, rep, .. } => write!(f, "[{kind:?}, {rep}]")?,
            Self::OverflowCheckedBinop { kind, rep, .. } => write!(f, "[{kind:?}, {rep}]")?,
            Self::Projection { index, rep, .. } => write!(f, "[{index}, {rep}]")?,
            Self::FloatBinop { kind, rep, .. } => write!(f, "[{kind:?}, {rep}]")?,
            Self::FloatUnary { kind, rep, .. } => write!(f, "[{kind:?}, {rep}]")?,
            Self::Shift { kind, rep, .. } => write!(f, "[{kind:?}, {rep}]")?,
            Self::Equal { rep, .. } | Self::Phi { rep, .. } | Self::PendingLoopPhi { rep, .. } => {
                write!(f, "[{rep}]")?
            }
            Self::Comparison { kind, rep, .. } => write!(f, "[{kind:?}, {rep}]")?,
            Self::Change { kind, from, to, .. } => write!(f, "[{kind:?}, {from} -> {to}]")?,
            Self::TaggedBitcast { from, to, .. } => write!(f, "[{from} -> {to}]")?,
            Self::Select { rep, implem, .. } => write!(f, "[{rep}, {implem:?}]")?,
            Self::Load {
                loaded_rep,
                result_rep,
                offset,
                element_size_log2,
                ..
            } => write!(f, "[{loaded_rep} -> {result_rep}, +{offset}, <<{element_size_log2}]")?,
            Self::Store {
                stored_rep,
                write_barrier,
                offset,
                element_size_log2,
                ..
            } => write!(f, "[{stored_rep}, {write_barrier:?}, +{offset}, <<{element_size_log2}]")?,
            Self::FrameState { info, .. } => write!(f, "[@{}]", info.bytecode_offset)?,
            Self::Call { descriptor, .. } => write!(f, "[{descriptor}]")?,
            Self::StackCheck { kind } | Self::StackPointerGreaterThan { kind, .. } => {
                write!(f, "[{kind:?}]")?
            }
            Self::Simd128Constant { value } => {
                f.write_str("(0x")?;
                for byte in value.iter().rev() {
                    write!(f, "{byte:02x}")?;
                }
                return f.write_str(")");
            }
            Self::Simd128Binop { kind, .. } => write!(f, "[{kind:?}]")?,
            Self::DeoptimizeIf {
                negated, reason, ..
            } => write!(f, "[{}{reason:?}]", if *negated { "!" } else { "" })?,
            Self::TrapIf { negated, trap, .. } => {
                write!(f, "[{}{trap:?}]", if *negated { "!" } else { "" })?
            }
            Self::Deoptimize { reason, .. } => write!(f, "[{reason:?}]")?,
            Self::Goto {
                destination,
                is_backedge,
            } => {
                return write!(
                    f,
                    " {destination}{}",
                    if *is_backedge { " (backedge)" } else { "" }
                );
            }
            Self::Branch {
                if_true, if_false, ..
            } => {
                write!(f, "({})", Inputs(&self.inputs()))?;
                return write!(f, " {if_true}, {if_false}");
            }
            Self::Switch { cases, default, .. } => {
                write!(f, "({})", Inputs(&self.inputs()))?;
                for case in cases.iter() {
                    write!(f, " {} => {},", case.value, case.destination)?;
                }
                return write!(f, " default => {default}");
            }
            Self::Retain { .. }
            | Self::LoadStackCheckOffset
            | Self::Return { .. }
            | Self::Unreachable => (),
        }
        write!(f, "({})", Inputs(&self.inputs()))
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.blocks() {
            write!(f, "{} ({})", block.index(), block.kind())?;
            if !block.predecessors().is_empty() {
                f.write_str(" <- ")?;
                for (i, pred) in block.predecessors().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{pred}")?;
                }
            }
            f.write_str(":\n")?;
            for (index, op) in self.operations(block.index()) {
                writeln!(f, "    {index}: {op}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{GraphBuilder, RegisterRepresentation};

    #[test]
    fn print_straight_line_graph() {
        let mut b = GraphBuilder::new();
        let entry = b.new_block();
        b.bind(entry);
        let a = b.parameter(0, RegisterRepresentation::Word32);
        let one = b.word32_constant(1);
        let sum = b.word32_add(a, one);
        b.return_([sum]);
        let graph = b.finish();

        let expected = "\
b0 (merge):
    o0: Parameter[w32](0)
    o1: Constant(w32 1)
    o2: WordBinop[Add, w32](o0, o1)
    o3: Constant(w32 0)
    o4: Return(o3, o2)
";
        assert_eq!(graph.to_string(), expected);
    }
}
