//! Block interpreter.
//!
//! A block is evaluated on a fork of its input frame, one instruction at a time. Every
//! instruction appends forward and inverse records to a [`Recorder`], so the block's
//! effect comes out as a pair of diffs along with the output frame. A failing
//! instruction is logged and skipped: its partial effects on the frame and on the
//! recorder are rolled back, and evaluation continues with the next one.
//!
//! At the end of the block every branch guard is evaluated over the sign lattice. A
//! branch is taken when its guard may be true, so several branches can be taken at once.

use log::{debug, trace, warn};

use crate::address::{self, Addr};
use crate::arith;
use crate::builtin::InvokeEnv;
use crate::class::ClassTable;
use crate::diff::Diff;
use crate::error::{CeskError, Result};
use crate::frame::{general, Frame, Recorder, EXCEPTION, RESULT};
use crate::insn::{Guard, Instruction, Method, Opcode, Operand, Target};
use crate::reloc::RelocTable;
use crate::set::Set;

/// Analysis-wide state shared by every block.
#[derive(Debug, Default)]
pub struct Context {
    pub classes: ClassTable,
    pub reloc: RelocTable,
}

impl Context {
    pub fn new(classes: ClassTable) -> Self {
        Self {
            classes,
            reloc: RelocTable::new(),
        }
    }
}

/// Result of interpreting one block.
#[derive(Debug, Clone)]
pub struct BlockOutput {
    pub frame: Frame,
    /// Turns the input frame into `frame`.
    pub forward: Diff,
    /// Turns `frame` back into the input frame.
    pub inverse: Diff,
    /// Targets of the branches that may be taken.
    pub edges: Vec<Target>,
}

/// Lattice points an operand may take.
///
/// Object references count as non-null, that is `{+}`. An empty register has not been
/// assigned on any path so far and may hold anything.
pub fn operand_bits(frame: &Frame, operand: Operand) -> u8 {
    match operand {
        Operand::Const(a) => a.const_bits().unwrap_or_else(|| {
            warn!("operand {} is not a constant", a);
            address::ANY
        }),
        Operand::Reg(r) => match frame.register(general(r)) {
            Some(s) if s.is_empty() => address::ANY,
            Some(s) => set_bits(s),
            None => {
                warn!("operand v{} out of range", r);
                address::ANY
            }
        },
    }
}

fn set_bits(s: &Set) -> u8 {
    let heap = if s.heap_addrs().next().is_some() { address::POS } else { 0 };
    s.constant_bits().unwrap_or(0) | heap
}

fn constant_set(bits: u8) -> Set {
    if bits == 0 {
        Set::empty()
    } else {
        Set::singleton(Addr::constant(bits))
    }
}

/// Whether a branch guarded by `guard` may be taken in `frame`.
pub fn is_taken(frame: &Frame, guard: &Guard) -> bool {
    match guard {
        Guard::Always => true,
        Guard::Exception => frame.register(EXCEPTION).is_some_and(|s| !s.is_empty()),
        Guard::Compare { op, left, right } => {
            let l = operand_bits(frame, *left);
            let r = operand_bits(frame, *right);
            let res = arith::to_boolean(op.eval_bits(l, r));
            trace!("guard {} {} {} => {}", Addr::constant(l), op, Addr::constant(r), Addr::constant(res));
            res & address::TRUE != 0
        }
    }
}

fn reg(frame: &Frame, r: usize) -> Result<Set> {
    frame
        .register(general(r))
        .map(Set::fork)
        .ok_or(CeskError::BadRegister(general(r) as u32))
}

/// Executes a single instruction.
pub fn step(ctx: &mut Context, frame: &mut Frame, insn: &Instruction, rec: &mut Recorder) -> Result<()> {
    trace!("{:>4}: {}", insn.index, insn.opcode);
    match &insn.opcode {
        Opcode::Nop => {}
        Opcode::Move { dst, src } => frame.register_move(general(*dst), general(*src), Some(&mut *rec))?,
        Opcode::MoveResult { dst } => frame.register_move(general(*dst), RESULT, Some(&mut *rec))?,
        Opcode::MoveException { dst } => {
            frame.register_move(general(*dst), EXCEPTION, Some(&mut *rec))?;
            frame.register_clear(EXCEPTION, Some(&mut *rec))?;
        }
        Opcode::Const { dst, value } => frame.register_load_const(general(*dst), *value, Some(&mut *rec))?,
        Opcode::NewInstance { dst, class } => {
            let r = frame.store_new_object(&ctx.classes, &mut ctx.reloc, insn.index, class, Some(&mut *rec))?;
            frame.register_assign(general(*dst), Set::singleton(r), Some(&mut *rec))?;
        }
        Opcode::GetField { dst, obj, class, field } => {
            frame.get_field(general(*dst), general(*obj), class, field, Some(&mut *rec))?
        }
        Opcode::PutField { src, obj, class, field } => {
            frame.put_field(general(*obj), class, field, general(*src), Some(&mut *rec))?
        }
        Opcode::GetStatic { dst, class, field } => {
            let addr = static_addr(&ctx.classes, class, field)?;
            frame.static_get(general(*dst), addr, Some(&mut *rec))?;
        }
        Opcode::PutStatic { src, class, field } => {
            let addr = static_addr(&ctx.classes, class, field)?;
            frame.static_put(addr, general(*src), Some(&mut *rec))?;
        }
        Opcode::Unary { op, dst, src } => {
            let bits = op.eval_bits(operand_bits(frame, *src));
            frame.register_assign(general(*dst), constant_set(bits), Some(&mut *rec))?;
        }
        Opcode::Binary { op, dst, left, right } => {
            let l = operand_bits(frame, *left);
            let r = operand_bits(frame, *right);
            let bits = op.eval_bits(l, r);
            if bits == 0 {
                warn!("{}: {} yields no value", insn.index, insn.opcode);
            }
            frame.register_assign(general(*dst), constant_set(bits), Some(&mut *rec))?;
        }
        Opcode::Invoke { class, method, args } => {
            let args = args.iter().map(|&r| reg(frame, r)).collect::<Result<Vec<_>>>()?;
            let result = match ctx.classes.builtins().get(class).cloned() {
                Some(builtin) => {
                    let mut env = InvokeEnv {
                        frame: &mut *frame,
                        recorder: Some(&mut *rec),
                        args,
                    };
                    builtin.invoke(method, &mut env)?
                }
                None => {
                    debug!("{}: {}->{} is opaque, result unknown", insn.index, class, method);
                    Set::empty()
                }
            };
            frame.register_assign(RESULT, result, Some(&mut *rec))?;
        }
        Opcode::Return { src } => {
            if let Some(src) = src {
                frame.register_move(RESULT, general(*src), Some(&mut *rec))?;
            }
        }
        Opcode::Throw { src } => frame.register_move(EXCEPTION, general(*src), Some(&mut *rec))?,
    }
    Ok(())
}

fn static_addr(classes: &ClassTable, class: &str, field: &str) -> Result<Addr> {
    classes.static_field(class, field).ok_or_else(|| CeskError::UnknownStatic {
        class: class.to_string(),
        field: field.to_string(),
    })
}

/// Interprets block `block` of `method` on `input`.
pub fn interpret_block(ctx: &mut Context, method: &Method, block: usize, input: &Frame) -> Result<BlockOutput> {
    let blk = method.blocks.get(block).ok_or(CeskError::NoBlock(block))?;
    let insns = method.block_insns(block).ok_or(CeskError::NoBlock(block))?;
    debug!("interpret block {} of {} ({} instructions)", block, method.name, insns.len());

    let mut frame = input.fork();
    let mut rec = Recorder::new();
    for insn in insns {
        let snapshot = frame.fork();
        let mark = rec.mark();
        if let Err(e) = step(ctx, &mut frame, insn, &mut rec) {
            warn!("{}: `{}` failed and is skipped: {}", insn.index, insn.opcode, e);
            frame = snapshot;
            rec.rollback(mark);
        }
    }

    let edges: Vec<Target> = blk
        .branches
        .iter()
        .filter(|b| is_taken(&frame, &b.guard))
        .map(|b| b.target)
        .collect();
    let (forward, inverse) = rec.finish()?;
    debug!("block {}: {} forward records, edges {:?}", block, forward.len(), edges);
    Ok(BlockOutput {
        frame,
        forward,
        inverse,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::any::Any;
    use std::rc::Rc;

    use crate::arith::BinOp;
    use crate::builtin::{BuiltinClass, BuiltinInstance};
    use crate::class::ClassDef;
    use crate::insn::Branch;
    use crate::statics::StaticTable;

    use test_log::test;

    fn context() -> Context {
        let mut classes = ClassTable::new();
        classes.define(
            ClassDef::new("LBox;")
                .field("item")
                .static_field("last", Addr::ZERO),
        );
        Context::new(classes)
    }

    fn entry(ctx: &Context, method: &Method) -> Frame {
        Frame::with_statics(method.nregs, StaticTable::new(ctx.classes.static_defaults()))
    }

    #[test]
    fn test_straight_line() {
        let mut ctx = context();
        let mut m = Method::new("f", 3);
        m.push_block(
            [
                Opcode::const_int(0, 4),
                Opcode::const_int(1, -2),
                Opcode::Binary {
                    op: BinOp::Mul,
                    dst: 2,
                    left: Operand::Reg(0),
                    right: Operand::Reg(1),
                },
            ],
            vec![Branch::always(Target::Exit)],
        );
        let input = entry(&ctx, &m);
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.frame.register(general(2)), Some(&Set::singleton(Addr::NEG)));
        assert_eq!(out.edges, vec![Target::Exit]);
        assert_eq!(input.register(general(2)), Some(&Set::empty()));

        let mut replay = input.fork();
        replay.apply(&out.forward, &ctx.reloc).unwrap();
        assert_eq!(replay, out.frame);
        replay.apply(&out.inverse, &ctx.reloc).unwrap();
        assert_eq!(replay, input);
    }

    #[test]
    fn test_objects_and_statics() {
        let mut ctx = context();
        let mut m = Method::new("f", 3);
        m.push_block(
            [
                Opcode::NewInstance {
                    dst: 0,
                    class: "LBox;".into(),
                },
                Opcode::const_bool(1, true),
                Opcode::PutField {
                    src: 1,
                    obj: 0,
                    class: "LBox;".into(),
                    field: "item".into(),
                },
                Opcode::GetField {
                    dst: 2,
                    obj: 0,
                    class: "LBox;".into(),
                    field: "item".into(),
                },
                Opcode::PutStatic {
                    src: 0,
                    class: "LBox;".into(),
                    field: "last".into(),
                },
            ],
            vec![Branch::always(Target::Exit)],
        );
        let input = entry(&ctx, &m);
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.frame.register(general(2)), Some(&Set::singleton(Addr::TRUE)));
        let last = ctx.classes.static_field("LBox;", "last").unwrap();
        let obj = out.frame.register(general(0)).unwrap().fork();
        assert_eq!(out.frame.read_register(last.raw()), Some(obj));
        assert_eq!(out.frame.hashcode(), out.frame.compute_hashcode());

        let mut replay = input.fork();
        replay.apply(&out.forward, &ctx.reloc).unwrap();
        assert_eq!(replay, out.frame);
    }

    #[test]
    fn test_failed_instruction_is_skipped() {
        let mut ctx = context();
        let mut m = Method::new("f", 2);
        m.push_block(
            [
                Opcode::const_int(0, 1),
                Opcode::NewInstance {
                    dst: 1,
                    class: "LMissing;".into(),
                },
                Opcode::GetStatic {
                    dst: 1,
                    class: "LBox;".into(),
                    field: "nope".into(),
                },
                Opcode::const_int(1, 0),
            ],
            vec![Branch::always(Target::Exit)],
        );
        let input = entry(&ctx, &m);
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.frame.register(general(0)), Some(&Set::singleton(Addr::POS)));
        assert_eq!(out.frame.register(general(1)), Some(&Set::singleton(Addr::ZERO)));
        assert!(out.frame.store().is_empty());
    }

    #[test]
    fn test_guards() {
        let mut ctx = context();
        let mut m = Method::new("f", 1);
        m.push_block(
            [Opcode::const_int(0, 3)],
            vec![
                Branch::when(Target::Block(1), BinOp::Gt, Operand::Reg(0), Operand::Const(Addr::ZERO)),
                Branch::when(Target::Block(2), BinOp::Le, Operand::Reg(0), Operand::Const(Addr::ZERO)),
                Branch::on_exception(Target::Block(3)),
            ],
        );
        let input = entry(&ctx, &m);
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.edges, vec![Target::Block(1)]);

        // an unassigned register may hold anything
        let mut frame = entry(&ctx, &m);
        let guard = Guard::Compare {
            op: BinOp::Eq,
            left: Operand::Reg(0),
            right: Operand::Const(Addr::ZERO),
        };
        assert!(is_taken(&frame, &guard));
        frame.register_load_const(general(0), Addr::POS, None).unwrap();
        assert!(!is_taken(&frame, &guard));
    }

    #[test]
    fn test_throw_takes_exception_edge() {
        let mut ctx = context();
        let mut m = Method::new("f", 1);
        m.push_block(
            [
                Opcode::NewInstance {
                    dst: 0,
                    class: "LBox;".into(),
                },
                Opcode::Throw { src: 0 },
            ],
            vec![Branch::on_exception(Target::Block(1))],
        );
        m.push_block([Opcode::MoveException { dst: 0 }], vec![Branch::always(Target::Exit)]);
        let input = entry(&ctx, &m);
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.edges, vec![Target::Block(1)]);
        let out = interpret_block(&mut ctx, &m, 1, &out.frame).unwrap();
        assert!(out.frame.register(EXCEPTION).unwrap().is_empty());
        assert_eq!(out.frame.register(general(0)).unwrap().len(), 1);
    }

    #[derive(Debug, Clone)]
    struct Counter {
        value: Set,
    }

    impl BuiltinInstance for Counter {
        fn duplicate(&self) -> Box<dyn BuiltinInstance> {
            Box::new(self.clone())
        }
        fn get_field(&self, field: &str) -> Option<Set> {
            (field == "value").then(|| self.value.fork())
        }
        fn put_field(&mut self, field: &str, value: &Set, keep_old: bool) -> bool {
            if field != "value" {
                return false;
            }
            if keep_old {
                self.value.merge(value);
            } else {
                self.value = value.fork();
            }
            true
        }
        fn referenced_addrs(&self, out: &mut Vec<Addr>) {
            out.extend(self.value.heap_addrs());
        }
        fn hash(&self) -> u64 {
            self.value.hashcode()
        }
        fn equal(&self, other: &dyn BuiltinInstance) -> bool {
            other.as_any().downcast_ref::<Counter>().is_some_and(|o| o.value == self.value)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct CounterClass;

    impl BuiltinClass for CounterClass {
        fn provides(&self) -> Vec<String> {
            vec!["LCounter;".to_string()]
        }
        fn initialize(&self, _classpath: &str) -> Box<dyn BuiltinInstance> {
            Box::new(Counter {
                value: Set::singleton(Addr::ZERO),
            })
        }
        fn invoke(&self, method: &str, env: &mut InvokeEnv<'_>) -> Result<Set> {
            match method {
                "next" => Ok(Set::singleton(Addr::POS)),
                "size" => Ok(env.args.first().map(Set::fork).unwrap_or_default()),
                _ => Err(CeskError::Builtin {
                    class: "LCounter;".to_string(),
                    message: format!("no method {}", method),
                }),
            }
        }
    }

    #[test]
    fn test_builtin_invoke_and_fields() {
        let mut ctx = context();
        ctx.classes.register_builtin(Rc::new(CounterClass));
        let mut m = Method::new("f", 3);
        m.push_block(
            [
                Opcode::NewInstance {
                    dst: 0,
                    class: "LCounter;".into(),
                },
                Opcode::Invoke {
                    class: "LCounter;".into(),
                    method: "next".into(),
                    args: vec![0],
                },
                Opcode::MoveResult { dst: 1 },
                Opcode::PutField {
                    src: 1,
                    obj: 0,
                    class: "LCounter;".into(),
                    field: "value".into(),
                },
                Opcode::GetField {
                    dst: 2,
                    obj: 0,
                    class: "LCounter;".into(),
                    field: "value".into(),
                },
                Opcode::Invoke {
                    class: "LCounter;".into(),
                    method: "reset".into(),
                    args: vec![],
                },
            ],
            vec![Branch::always(Target::Exit)],
        );
        let input = entry(&ctx, &m);
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.frame.register(general(1)), Some(&Set::singleton(Addr::POS)));
        assert_eq!(out.frame.register(general(2)), Some(&Set::singleton(Addr::POS)));
        // the failed invoke left the result register alone
        assert_eq!(out.frame.register(RESULT), Some(&Set::singleton(Addr::POS)));

        let mut replay = input.fork();
        replay.apply(&out.forward, &ctx.reloc).unwrap();
        assert_eq!(replay, out.frame);
    }

    #[test]
    fn test_opaque_invoke() {
        let mut ctx = context();
        let mut m = Method::new("f", 1);
        m.push_block(
            [
                Opcode::const_int(0, 1),
                Opcode::Invoke {
                    class: "LUnknown;".into(),
                    method: "g".into(),
                    args: vec![0],
                },
            ],
            vec![Branch::always(Target::Exit)],
        );
        let mut input = entry(&ctx, &m);
        input.register_load_const(RESULT, Addr::NEG, None).unwrap();
        let out = interpret_block(&mut ctx, &m, 0, &input).unwrap();
        assert_eq!(out.frame.register(RESULT), Some(&Set::empty()));
    }

    #[test]
    fn test_no_block() {
        let mut ctx = context();
        let m = Method::new("f", 1);
        let input = entry(&ctx, &m);
        assert!(matches!(
            interpret_block(&mut ctx, &m, 3, &input),
            Err(CeskError::NoBlock(3))
        ));
    }
}
