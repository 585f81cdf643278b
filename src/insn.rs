//! Decoded instructions and control-flow graphs, as handed over by the bytecode
//! frontend.
//!
//! Registers named here are the method's own registers `v0..v(n-1)`; the interpreter
//! maps them onto [`general`][crate::frame::general] frame registers.

use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::rc::Rc;

use crate::address::Addr;
use crate::arith::{BinOp, UnOp};

/// Instruction operand.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Operand {
    Reg(usize),
    Const(Addr),
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "v{}", r),
            Operand::Const(a) => write!(f, "{}", a),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Nop,
    Move {
        dst: usize,
        src: usize,
    },
    MoveResult {
        dst: usize,
    },
    MoveException {
        dst: usize,
    },
    Const {
        dst: usize,
        value: Addr,
    },
    NewInstance {
        dst: usize,
        class: Rc<str>,
    },
    GetField {
        dst: usize,
        obj: usize,
        class: Rc<str>,
        field: Rc<str>,
    },
    PutField {
        src: usize,
        obj: usize,
        class: Rc<str>,
        field: Rc<str>,
    },
    GetStatic {
        dst: usize,
        class: Rc<str>,
        field: Rc<str>,
    },
    PutStatic {
        src: usize,
        class: Rc<str>,
        field: Rc<str>,
    },
    Unary {
        op: UnOp,
        dst: usize,
        src: Operand,
    },
    Binary {
        op: BinOp,
        dst: usize,
        left: Operand,
        right: Operand,
    },
    Invoke {
        class: Rc<str>,
        method: Rc<str>,
        args: Vec<usize>,
    },
    Return {
        src: Option<usize>,
    },
    Throw {
        src: usize,
    },
}

impl Opcode {
    /// Loads the sign of an integer literal.
    pub fn const_int(dst: usize, value: i64) -> Self {
        let value = match value {
            v if v < 0 => Addr::NEG,
            0 => Addr::ZERO,
            _ => Addr::POS,
        };
        Opcode::Const { dst, value }
    }

    pub fn const_bool(dst: usize, value: bool) -> Self {
        let value = if value { Addr::TRUE } else { Addr::FALSE };
        Opcode::Const { dst, value }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Nop => write!(f, "nop"),
            Opcode::Move { dst, src } => write!(f, "move v{}, v{}", dst, src),
            Opcode::MoveResult { dst } => write!(f, "move-result v{}", dst),
            Opcode::MoveException { dst } => write!(f, "move-exception v{}", dst),
            Opcode::Const { dst, value } => write!(f, "const v{}, {}", dst, value),
            Opcode::NewInstance { dst, class } => write!(f, "new-instance v{}, {}", dst, class),
            Opcode::GetField { dst, obj, class, field } => write!(f, "iget v{}, v{}, {}->{}", dst, obj, class, field),
            Opcode::PutField { src, obj, class, field } => write!(f, "iput v{}, v{}, {}->{}", src, obj, class, field),
            Opcode::GetStatic { dst, class, field } => write!(f, "sget v{}, {}->{}", dst, class, field),
            Opcode::PutStatic { src, class, field } => write!(f, "sput v{}, {}->{}", src, class, field),
            Opcode::Unary { op, dst, src } => write!(f, "v{} = {}{}", dst, op, src),
            Opcode::Binary { op, dst, left, right } => write!(f, "v{} = {} {} {}", dst, left, op, right),
            Opcode::Invoke { class, method, args } => {
                write!(f, "invoke {}->{}(", class, method)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "v{}", a)?;
                }
                write!(f, ")")
            }
            Opcode::Return { src: Some(r) } => write!(f, "return v{}", r),
            Opcode::Return { src: None } => write!(f, "return-void"),
            Opcode::Throw { src } => write!(f, "throw v{}", src),
        }
    }
}

/// One decoded instruction. `index` is its position in the source method, and doubles
/// as the allocation-site id of `new-instance`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub index: u32,
    pub opcode: Opcode,
}

/// Where a branch leads.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Target {
    Block(usize),
    /// Leaves the method.
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    Always,
    /// Taken when `left op right` may be true.
    Compare { op: BinOp, left: Operand, right: Operand },
    /// Taken when an exception may be pending.
    Exception,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub target: Target,
    pub guard: Guard,
}

impl Branch {
    pub fn always(target: Target) -> Self {
        Self {
            target,
            guard: Guard::Always,
        }
    }

    pub fn when(target: Target, op: BinOp, left: Operand, right: Operand) -> Self {
        Self {
            target,
            guard: Guard::Compare { op, left, right },
        }
    }

    pub fn on_exception(target: Target) -> Self {
        Self {
            target,
            guard: Guard::Exception,
        }
    }
}

/// Basic block: a range of instructions and its outgoing branches.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub range: Range<usize>,
    pub branches: Vec<Branch>,
}

/// A method body with its control-flow graph.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: Rc<str>,
    /// Number of method registers.
    pub nregs: usize,
    pub insns: Vec<Instruction>,
    pub blocks: Vec<Block>,
    pub entry: usize,
}

impl Method {
    pub fn new(name: &str, nregs: usize) -> Self {
        Self {
            name: name.into(),
            nregs,
            insns: Vec::new(),
            blocks: Vec::new(),
            entry: 0,
        }
    }

    /// Appends a block made of `opcodes`, numbering instructions after the existing ones.
    /// Returns the block index.
    pub fn push_block(&mut self, opcodes: impl IntoIterator<Item = Opcode>, branches: Vec<Branch>) -> usize {
        let start = self.insns.len();
        for opcode in opcodes {
            let index = self.insns.len() as u32;
            self.insns.push(Instruction { index, opcode });
        }
        self.blocks.push(Block {
            range: start..self.insns.len(),
            branches,
        });
        self.blocks.len() - 1
    }

    /// Instructions of block `b`, or `None` if the block or its range is invalid.
    pub fn block_insns(&self, b: usize) -> Option<&[Instruction]> {
        let block = self.blocks.get(b)?;
        self.insns.get(block.range.clone())
    }

    /// Blocks with a branch into `b`.
    pub fn predecessors(&self, b: usize) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, blk)| blk.branches.iter().any(|br| br.target == Target::Block(b)))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_push_block() {
        let mut m = Method::new("f", 2);
        let b0 = m.push_block(
            [Opcode::const_int(0, 5), Opcode::const_int(1, -1)],
            vec![Branch::always(Target::Block(1))],
        );
        let b1 = m.push_block([Opcode::Return { src: Some(0) }], vec![Branch::always(Target::Exit)]);
        assert_eq!((b0, b1), (0, 1));
        assert_eq!(m.block_insns(1).map(|i| i[0].index), Some(2));
        assert_eq!(m.predecessors(1), vec![0]);
        assert_eq!(m.block_insns(7), None);
    }

    #[test]
    fn test_const_int() {
        assert_eq!(Opcode::const_int(0, -3), Opcode::Const { dst: 0, value: Addr::NEG });
        assert_eq!(Opcode::const_int(0, 0), Opcode::Const { dst: 0, value: Addr::ZERO });
        assert_eq!(Opcode::const_int(0, 9), Opcode::Const { dst: 0, value: Addr::POS });
    }

    #[test]
    fn test_display() {
        let op = Opcode::Binary {
            op: BinOp::Add,
            dst: 2,
            left: Operand::Reg(0),
            right: Operand::Const(Addr::POS),
        };
        assert_eq!(op.to_string(), format!("v2 = v0 + {}", Addr::POS));
    }
}
