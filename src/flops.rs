//! Op counting mode for compute profiling.
//!
//! Layers report every matmul-like op they execute through [`record`]. The
//! reports are dropped unless an [`OpCounter`] is installed on the current
//! thread, so counting costs nothing during normal inference.
//!
//! ```no_run
//! # use mammut::flops::OpCounter;
//! let counter = OpCounter::new();
//! {
//!     let _guard = counter.install();
//!     // run a forward pass here
//! }
//! println!("{} MACs", counter.total_macs());
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Kind of a counted op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    /// Dense projection `x W^T + b`.
    Linear,
    /// Patch embedding convolution.
    Conv2d,
    /// Attention scores `Q K^T`.
    AttentionScores,
    /// Attention-weighted values `softmax(S) V`.
    AttentionValues,
    /// Plain matrix product with a parameter matrix.
    Matmul,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Linear => "linear",
            OpKind::Conv2d => "conv2d",
            OpKind::AttentionScores => "attention_scores",
            OpKind::AttentionValues => "attention_values",
            OpKind::Matmul => "matmul",
        };
        f.write_str(name)
    }
}

/// One recorded op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRecord {
    pub kind: OpKind,
    /// Multiply-accumulate operations.
    pub macs: u64,
    /// Elements in the op output.
    pub activations: u64,
}

#[derive(Debug, Default)]
struct Tally {
    records: Vec<OpRecord>,
}

thread_local! {
    static ACTIVE: RefCell<Option<Rc<RefCell<Tally>>>> = const { RefCell::new(None) };
}

/// Collects op records while installed on a thread.
#[derive(Debug, Clone, Default)]
pub struct OpCounter {
    tally: Rc<RefCell<Tally>>,
}

/// Restores the previously installed counter when dropped.
pub struct CounterGuard {
    previous: Option<Rc<RefCell<Tally>>>,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|active| *active.borrow_mut() = previous);
    }
}

impl OpCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting on the current thread until the guard is dropped.
    pub fn install(&self) -> CounterGuard {
        let previous = ACTIVE.with(|active| active.borrow_mut().replace(self.tally.clone()));
        CounterGuard { previous }
    }

    pub fn records(&self) -> Vec<OpRecord> {
        self.tally.borrow().records.clone()
    }

    pub fn reset(&self) {
        self.tally.borrow_mut().records.clear();
    }

    pub fn total_macs(&self) -> u64 {
        self.tally.borrow().records.iter().map(|r| r.macs).sum()
    }

    /// FLOPs counting one multiply and one add per MAC.
    pub fn total_flops(&self) -> u64 {
        2 * self.total_macs()
    }

    pub fn total_activations(&self) -> u64 {
        self.tally.borrow().records.iter().map(|r| r.activations).sum()
    }

    /// MACs grouped by op kind.
    pub fn macs_by_kind(&self) -> BTreeMap<OpKind, u64> {
        let mut out = BTreeMap::new();
        for r in &self.tally.borrow().records {
            *out.entry(r.kind).or_insert(0) += r.macs;
        }
        out
    }
}

/// Whether a counter is installed on this thread.
pub fn is_counting() -> bool {
    ACTIVE.with(|active| active.borrow().is_some())
}

/// Report an op to the installed counter, if any.
pub fn record(kind: OpKind, macs: u64, activations: u64) {
    ACTIVE.with(|active| {
        if let Some(tally) = active.borrow().as_ref() {
            tally.borrow_mut().records.push(OpRecord {
                kind,
                macs,
                activations,
            });
        }
    });
}

/// Report a (batched) matmul `[.., m, k] x [k, n]` with `batch` leading rows.
pub fn record_matmul(kind: OpKind, batch: usize, m: usize, k: usize, n: usize) {
    let out = (batch * m * n) as u64;
    record(kind, out * k as u64, out);
}
