//! Runs the analyzer on a small list-building method and prints the fixpoint.
//!
//! ```bash
//! cargo run --example trace -- --log-level debug
//! ```

use clap::Parser;

use cesk_rs::address::Addr;
use cesk_rs::analyzer::{Analyzer, AnalyzerConfig};
use cesk_rs::arith::BinOp;
use cesk_rs::class::{ClassDef, ClassTable};
use cesk_rs::frame::Frame;
use cesk_rs::insn::{Branch, Method, Opcode, Operand, Target};
use cesk_rs::interp::Context;
use cesk_rs::statics::StaticTable;
use cesk_rs::store::{Store, StoreConfig};

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Log level.
    #[clap(long, value_name = "LEVEL", default_value = "info")]
    log_level: simplelog::LevelFilter,

    /// Number of slots in a store block.
    #[clap(long, value_name = "INT", default_value = "64")]
    block_slots: usize,

    /// Maximum number of analyzer rounds.
    #[clap(long, value_name = "INT", default_value = "256")]
    max_rounds: usize,

    /// Disable garbage collection between rounds.
    #[clap(long)]
    no_gc: bool,
}

/// ```text
/// b0:  v0 = 0; v1 = 0
/// b1:  if v1 < + goto b2; if v1 >= + goto b3
/// b2:  v2 = new LNode; v2.next = v0; v0 = v2; v1 = v1 + 1; LNode.count = v1; goto b1
/// b3:  return v0
/// ```
fn build_list() -> Method {
    let mut m = Method::new("LMain;->build()LNode;", 3);
    m.push_block(
        [Opcode::const_int(0, 0), Opcode::const_int(1, 0)],
        vec![Branch::always(Target::Block(1))],
    );
    m.push_block(
        [Opcode::Nop],
        vec![
            Branch::when(Target::Block(2), BinOp::Lt, Operand::Reg(1), Operand::Const(Addr::POS)),
            Branch::when(Target::Block(3), BinOp::Ge, Operand::Reg(1), Operand::Const(Addr::POS)),
        ],
    );
    m.push_block(
        [
            Opcode::NewInstance {
                dst: 2,
                class: "LNode;".into(),
            },
            Opcode::PutField {
                src: 0,
                obj: 2,
                class: "LNode;".into(),
                field: "next".into(),
            },
            Opcode::Move { dst: 0, src: 2 },
            Opcode::Binary {
                op: BinOp::Add,
                dst: 1,
                left: Operand::Reg(1),
                right: Operand::Const(Addr::POS),
            },
            Opcode::PutStatic {
                src: 1,
                class: "LNode;".into(),
                field: "count".into(),
            },
        ],
        vec![Branch::always(Target::Block(1))],
    );
    m.push_block([Opcode::Return { src: Some(0) }], vec![Branch::always(Target::Exit)]);
    m
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();

    simplelog::TermLogger::init(
        args.log_level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    println!("args = {:?}", args);

    let mut classes = ClassTable::new();
    classes.define(
        ClassDef::new("LNode;")
            .field("next")
            .static_field("count", Addr::ZERO),
    );
    let statics = StaticTable::new(classes.static_defaults());

    let method = build_list();
    for (i, block) in method.blocks.iter().enumerate() {
        println!("b{}:", i);
        for insn in &method.insns[block.range.clone()] {
            println!("  {:>3}: {}", insn.index, insn.opcode);
        }
    }

    let store = Store::with_config(StoreConfig {
        block_slots: args.block_slots,
        ..Default::default()
    });
    let entry = Frame::with_store(method.nregs, store, statics);

    let config = AnalyzerConfig {
        max_rounds: args.max_rounds,
        gc_each_round: !args.no_gc,
        ..Default::default()
    };
    let mut analyzer = Analyzer::with_config(Context::new(classes), config);

    let time_analysis = std::time::Instant::now();
    let analysis = analyzer.analyze(&method, entry)?;
    let time_analysis = time_analysis.elapsed();

    println!(
        "{} after {} rounds in {:.3} ms (cache: {} hits, {} misses)",
        if analysis.converged { "Fixpoint" } else { "No fixpoint" },
        analysis.rounds,
        time_analysis.as_secs_f64() * 1000.0,
        analyzer.cache_hits(),
        analyzer.cache_misses()
    );
    for (i, input) in analysis.inputs.iter().enumerate() {
        match input {
            Some(frame) => print!("input of b{}:\n{}", i, frame),
            None => println!("b{} is unreachable", i),
        }
    }
    if let Some(result) = &analysis.result {
        print!("result:\n{}", result);
    }

    Ok(())
}
