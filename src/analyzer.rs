//! Method-level fixpoint driver.
//!
//! The analyzer runs rounds over a worklist of blocks. In each round every queued block
//! is interpreted on its current input frame; the output frames then flow along the
//! taken edges:
//!
//! ```text
//!   round k:   input[b] --interpret--> out[b] --edges--> { t1, t2, Exit }
//!   merge:     input[t] := input[t] ⊔ out[p1] ⊔ out[p2] ...   (one factorized diff)
//!   requeue:   t, if the diff was not empty
//! ```
//!
//! Arriving frames are not joined one by one. For each target, the join diff against
//! every arriving frame is computed on the current input, the diffs are factorized
//! into one, and that single diff is applied. The process stops once no input changes,
//! or after [`AnalyzerConfig::max_rounds`].
//!
//! Interpretation results are cached per `(method, block, input frame)`: an input that
//! comes back unchanged is not interpreted again.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use log::{debug, info, warn};

use crate::cache::Cache;
use crate::diff::Diff;
use crate::error::{CeskError, DiffError, Result};
use crate::frame::Frame;
use crate::insn::{Method, Target};
use crate::interp::{interpret_block, BlockOutput, Context};
use crate::reloc::RelocTable;
use crate::utils::{hash_str, hash_u32, mix3, MyHash};

/// Analyzer parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AnalyzerConfig {
    /// Rounds after which the analysis gives up.
    pub max_rounds: usize,
    /// Collect garbage in every block output before it is propagated.
    pub gc_each_round: bool,
    /// The block cache has `2^cache_bits` entries.
    pub cache_bits: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_rounds: 256,
            gc_each_round: true,
            cache_bits: 10,
        }
    }
}

#[derive(PartialEq)]
struct BlockKey {
    method: Rc<str>,
    block: usize,
    input: Frame,
}

impl MyHash for BlockKey {
    fn hash(&self) -> u64 {
        mix3(hash_str(&self.method), hash_u32(self.block as u32), self.input.hashcode())
    }
}

/// Outcome of analyzing one method.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Fixpoint input frame of every block, `None` for unreachable blocks.
    pub inputs: Vec<Option<Frame>>,
    /// Join of every frame leaving the method.
    pub result: Option<Frame>,
    pub rounds: usize,
    /// `false` if the round limit was hit first.
    pub converged: bool,
}

impl Analysis {
    pub fn input(&self, block: usize) -> Option<&Frame> {
        self.inputs.get(block).and_then(Option::as_ref)
    }

    pub fn is_reachable(&self, block: usize) -> bool {
        self.input(block).is_some()
    }
}

pub struct Analyzer {
    config: AnalyzerConfig,
    ctx: Context,
    cache: Cache<BlockKey, BlockOutput>,
}

impl Analyzer {
    pub fn new(ctx: Context) -> Self {
        Self::with_config(ctx, AnalyzerConfig::default())
    }

    pub fn with_config(ctx: Context, config: AnalyzerConfig) -> Self {
        Self {
            cache: Cache::new(config.cache_bits),
            config,
            ctx,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn cache_hits(&self) -> usize {
        self.cache.hits()
    }

    pub fn cache_misses(&self) -> usize {
        self.cache.misses()
    }

    fn interpret(&mut self, method: &Method, block: usize, input: &Frame) -> Result<BlockOutput> {
        let key = BlockKey {
            method: Rc::clone(&method.name),
            block,
            input: input.fork(),
        };
        if let Some(out) = self.cache.get(&key) {
            debug!("block {}: cached", block);
            return Ok(out.clone());
        }
        let out = interpret_block(&mut self.ctx, method, block, input)?;
        self.cache.insert(key, out.clone());
        Ok(out)
    }

    /// Runs `method` from `entry` to a fixpoint.
    pub fn analyze(&mut self, method: &Method, entry: Frame) -> Result<Analysis> {
        let n = method.blocks.len();
        if method.entry >= n {
            return Err(CeskError::NoBlock(method.entry));
        }
        info!("analyzing {} ({} blocks)", method.name, n);

        let mut inputs: Vec<Option<Frame>> = vec![None; n];
        inputs[method.entry] = Some(entry);
        let mut worklist = BTreeSet::from([method.entry]);
        let mut result = None;
        let mut rounds = 0;
        let mut converged = true;

        while !worklist.is_empty() {
            if rounds >= self.config.max_rounds {
                warn!(
                    "{}: no fixpoint after {} rounds, {} blocks still queued",
                    method.name,
                    rounds,
                    worklist.len()
                );
                converged = false;
                break;
            }
            rounds += 1;
            debug!("round {}: blocks {:?}", rounds, worklist);

            let mut arrivals: BTreeMap<Target, Vec<Frame>> = BTreeMap::new();
            for b in std::mem::take(&mut worklist) {
                let Some(input) = inputs[b].as_ref().map(Frame::fork) else {
                    continue;
                };
                let out = self.interpret(method, b, &input)?;
                let mut frame = out.frame;
                if self.config.gc_each_round {
                    frame.gc(None);
                }
                for t in out.edges {
                    arrivals.entry(t).or_default().push(frame.fork());
                }
            }

            for (target, frames) in arrivals {
                match target {
                    Target::Block(t) => {
                        let Some(slot) = inputs.get_mut(t) else {
                            warn!("{}: branch to missing block {}", method.name, t);
                            continue;
                        };
                        if join_into(slot, frames, &self.ctx.reloc)? {
                            worklist.insert(t);
                        }
                    }
                    Target::Exit => {
                        join_into(&mut result, frames, &self.ctx.reloc)?;
                    }
                }
            }
        }

        info!(
            "{}: {} after {} rounds ({} cache hits, {} misses)",
            method.name,
            if converged { "fixpoint" } else { "stopped" },
            rounds,
            self.cache.hits(),
            self.cache.misses()
        );
        Ok(Analysis {
            inputs,
            result,
            rounds,
            converged,
        })
    }
}

/// Joins `frames` into `slot`. Returns `true` if `slot` changed.
fn join_into(slot: &mut Option<Frame>, frames: Vec<Frame>, reloc: &RelocTable) -> Result<bool> {
    let mut frames = frames.into_iter();
    match slot {
        None => {
            let Some(mut first) = frames.next() else {
                return Ok(false);
            };
            for other in frames {
                let diff = first.join_diff(&other)?;
                first.apply(&diff, reloc)?;
            }
            *slot = Some(first);
            Ok(true)
        }
        Some(current) => {
            let diffs = frames
                .map(|other| current.join_diff(&other))
                .collect::<std::result::Result<Vec<Diff>, DiffError>>()?;
            let refs: Vec<&Diff> = diffs.iter().collect();
            let diff = Diff::factorize(&refs, current)?;
            if diff.is_empty() {
                return Ok(false);
            }
            debug!("join: {}", diff);
            current.apply(&diff, reloc)?;
            Ok(true)
        }
    }
}
