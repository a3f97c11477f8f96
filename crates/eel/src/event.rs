//! Compiler events.
//!
//! Events track what compiled code is known to have done: left the block
//! (`Exit`), left the function (`Return`), initialized the function
//! result (`Result`), been jumped back into (`Target`), and initialized
//! each variable register. Each compiler context owns a list of event
//! lists; normally just one. When a conditional sub-context pops, its
//! list is moved up as a *sibling* of the parent's master list, and once
//! all branches of a construct have been collected, [`merge_branches`]
//! folds the siblings into the master: an event that happened in every
//! branch is certain, one that happened in some branches only is a
//! maybe, and the whole group is clamped by a modulator describing
//! whether the branches cover all paths.
//!
//! Because the tests walk the current context *and* its ancestors up to
//! the function boundary, code never needs to know whether it is being
//! compiled conditionally; the combined event state always reflects the
//! truth at the current emission point.

use crate::diag::{CompileError, CompileResult, ErrorKind};

/// Highest addressable variable register.
pub const MAX_REG: usize = 255;

/// Certainty of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CeState {
    #[default]
    No = 0,
    Maybe = 1,
    Yes = 2,
}

impl CeState {
    /// "Once or maybe more"; used as the merge modulator for loops whose
    /// bodies run at least once.
    pub const MULTIPLE: Self = Self::Maybe;

    /// Inverts certainty: the certainty that an event did NOT occur.
    #[must_use]
    pub fn not(self) -> Self {
        match self {
            Self::No => Self::Yes,
            Self::Maybe => Self::Maybe,
            Self::Yes => Self::No,
        }
    }

    #[must_use]
    fn from_sum(sum: u32, branches: u32) -> Self {
        if sum == 0 {
            Self::No
        } else if sum == branches * 2 {
            Self::Yes
        } else {
            Self::Maybe
        }
    }
}

/// One event list: control events, per-register init events, and how many
/// context levels a `break` has escaped.
#[derive(Debug, Clone)]
pub struct EventList {
    inits: Box<[CeState; MAX_REG + 1]>,
    pub exit: CeState,
    pub ret: CeState,
    pub result: CeState,
    pub target: CeState,
    pub break_to: i32,
    pub maybe_break_to: i32,
}

impl Default for EventList {
    fn default() -> Self {
        Self {
            inits: Box::new([CeState::No; MAX_REG + 1]),
            exit: CeState::No,
            ret: CeState::No,
            result: CeState::No,
            target: CeState::No,
            break_to: 0,
            maybe_break_to: 0,
        }
    }
}

impl EventList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn init(&self, reg: usize) -> CeState {
        self.inits[reg]
    }

    /// Records that the variable at `reg` was initialized. The caller has
    /// already verified the register is in range and not yet initialized.
    pub fn set_init(&mut self, reg: usize) {
        self.inits[reg] = CeState::Yes;
    }

    /// Raises the init state for `reg` to at least `st`.
    pub fn raise_init(&mut self, reg: usize, st: CeState) {
        if st > self.inits[reg] {
            self.inits[reg] = st;
        }
    }

    pub fn set_exit(&mut self) {
        self.exit = CeState::Yes;
    }

    pub fn set_return(&mut self) {
        self.ret = CeState::Yes;
    }

    pub fn set_result(&mut self) {
        self.result = CeState::Yes;
    }

    /// Records that a backward jump may land at the current position with
    /// the given certainty.
    pub fn set_target(&mut self, st: CeState) {
        if st > self.target {
            self.target = st;
        }
    }

    /// Records a break escaping `depth` context levels.
    pub fn set_break(&mut self, depth: i32) {
        if depth > self.break_to {
            self.break_to = depth;
        }
    }

    /// Combined break certainty at this context.
    #[must_use]
    pub fn break_state(&self) -> CeState {
        if self.break_to > 0 {
            CeState::Yes
        } else if self.maybe_break_to > 0 {
            CeState::Maybe
        } else {
            CeState::No
        }
    }

    /// Prepares this list for moving up out of a popped *conditional*
    /// context: exit and target events die with the context, init events
    /// die unless the context was a plain statement block
    /// (`keep_inits`), and break counters walk up one level.
    pub fn prepare_move_up(&mut self, keep_inits: bool) {
        self.exit = CeState::No;
        self.target = CeState::No;
        if !keep_inits {
            self.inits.fill(CeState::No);
        }
        if self.break_to > 0 {
            self.break_to -= 1;
        }
        if self.maybe_break_to > 0 {
            self.maybe_break_to -= 1;
        }
    }

    /// Prepares this list for moving up out of a popped xblock function
    /// context: only return and result events survive.
    pub fn prepare_move_up_xblock(&mut self) {
        self.exit = CeState::No;
        self.target = CeState::No;
        self.inits.fill(CeState::No);
        self.break_to = 0;
        self.maybe_break_to = 0;
    }

    /// Merges this list into `parent`, used when popping a
    /// *non-conditional* context: per-cell maximum, except that target
    /// events never escape and init events only escape statement blocks.
    pub fn merge_into(&self, parent: &mut Self, keep_inits: bool) {
        if keep_inits {
            for r in 0..=MAX_REG {
                parent.raise_init(r, self.inits[r]);
            }
        }
        if self.exit > parent.exit {
            parent.exit = self.exit;
        }
        if self.ret > parent.ret {
            parent.ret = self.ret;
        }
        if self.result > parent.result {
            parent.result = self.result;
        }
        if self.break_to > parent.break_to {
            parent.break_to = self.break_to;
        }
        if self.maybe_break_to > parent.maybe_break_to {
            parent.maybe_break_to = self.maybe_break_to;
        }
    }

    /// Number of certainly-initialized registers recorded here; errors if
    /// any register is only maybe-initialized.
    pub fn count_certain_inits(&self) -> CompileResult<usize> {
        let mut count = 0;
        for st in self.inits.iter() {
            match st {
                CeState::Yes => count += 1,
                CeState::Maybe => {
                    return Err(CompileError {
                        kind: ErrorKind::Init,
                        message: "Some variables may or may not be initialized at this point!".to_string(),
                        line: 0,
                        col: 0,
                    });
                }
                CeState::No => {}
            }
        }
        Ok(count)
    }
}

/// Folds collected sibling branch lists into the master list of a
/// conditional construct.
///
/// For every event, the branch states are summed: all-yes is certain,
/// all-absent is nothing, anything else is a maybe; the result is clamped
/// by `modulator` (Yes when the branches cover every possible path, Maybe
/// otherwise) and raised into the master.
///
/// Break depths fold separately: every branch's depth minus one raises
/// the master's maybe-break; the *shallowest* definite break reached by
/// all branches raises the definite break, but only when the modulator is
/// certain.
pub fn merge_branches(master: &mut EventList, branches: &[EventList], modulator: CeState) {
    if branches.is_empty() {
        return;
    }
    let n = u32::try_from(branches.len()).unwrap_or(u32::MAX);

    let fold = |get: &dyn Fn(&EventList) -> CeState| -> CeState {
        let sum: u32 = branches.iter().map(|b| get(b) as u32).sum();
        let mut st = CeState::from_sum(sum, n);
        if st > modulator {
            st = modulator;
        }
        st
    };

    for r in 0..=MAX_REG {
        let st = fold(&|b: &EventList| b.inits[r]);
        master.raise_init(r, st);
    }
    let ret = fold(&|b: &EventList| b.ret);
    if ret > master.ret {
        master.ret = ret;
    }
    let result = fold(&|b: &EventList| b.result);
    if result > master.result {
        master.result = result;
    }

    let mut shallowest = i32::MAX;
    for b in branches {
        let break_to = b.break_to - 1;
        let maybe_break_to = b.maybe_break_to - 1;
        if break_to > master.maybe_break_to {
            master.maybe_break_to = break_to;
        }
        if maybe_break_to > master.maybe_break_to {
            master.maybe_break_to = maybe_break_to;
        }
        if break_to < shallowest {
            shallowest = break_to;
        }
    }
    if modulator > CeState::Maybe && shallowest > master.break_to {
        master.break_to = shallowest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_and_not() {
        assert!(CeState::No < CeState::Maybe);
        assert!(CeState::Maybe < CeState::Yes);
        assert_eq!(CeState::No.not(), CeState::Yes);
        assert_eq!(CeState::Maybe.not(), CeState::Maybe);
        assert_eq!(CeState::Yes.not(), CeState::No);
    }

    #[test]
    fn merge_all_branches_initialize() {
        let mut master = EventList::new();
        let mut a = EventList::new();
        let mut b = EventList::new();
        a.set_init(3);
        b.set_init(3);
        merge_branches(&mut master, &[a, b], CeState::Yes);
        assert_eq!(master.init(3), CeState::Yes);
    }

    #[test]
    fn merge_some_branches_initialize() {
        let mut master = EventList::new();
        let mut a = EventList::new();
        let b = EventList::new();
        a.set_init(3);
        merge_branches(&mut master, &[a, b], CeState::Yes);
        assert_eq!(master.init(3), CeState::Maybe);
    }

    #[test]
    fn modulator_clamps_certainty() {
        // A single branch that certainly initializes, but the construct
        // does not cover all paths (if without else).
        let mut master = EventList::new();
        let mut a = EventList::new();
        a.set_init(0);
        a.set_return();
        merge_branches(&mut master, &[a], CeState::Maybe);
        assert_eq!(master.init(0), CeState::Maybe);
        assert_eq!(master.ret, CeState::Maybe);
    }

    #[test]
    fn exit_and_target_do_not_escape_merges() {
        let mut master = EventList::new();
        let mut a = EventList::new();
        a.set_exit();
        a.set_target(CeState::Yes);
        merge_branches(&mut master, &[a], CeState::Yes);
        assert_eq!(master.exit, CeState::No);
        assert_eq!(master.target, CeState::No);
    }

    #[test]
    fn move_up_decrements_breaks_and_drops_inits() {
        let mut e = EventList::new();
        e.set_init(1);
        e.set_exit();
        e.set_break(2);
        e.prepare_move_up(false);
        assert_eq!(e.init(1), CeState::No);
        assert_eq!(e.exit, CeState::No);
        assert_eq!(e.break_to, 1);

        let mut e = EventList::new();
        e.set_init(1);
        e.prepare_move_up(true);
        assert_eq!(e.init(1), CeState::Yes);
    }

    #[test]
    fn break_depth_folding() {
        // Both branches break out 2 levels: the merged context (1 level
        // up) still sees a definite break of depth 1.
        let mut master = EventList::new();
        let mut a = EventList::new();
        let mut b = EventList::new();
        a.set_break(2);
        b.set_break(2);
        merge_branches(&mut master, &[a, b], CeState::Yes);
        assert_eq!(master.break_to, 1);
        assert_eq!(master.break_state(), CeState::Yes);

        // Only one branch breaks: a maybe.
        let mut master = EventList::new();
        let mut a = EventList::new();
        a.set_break(2);
        let b = EventList::new();
        merge_branches(&mut master, &[a, b], CeState::Yes);
        assert_eq!(master.break_to, 0);
        assert_eq!(master.maybe_break_to, 1);
        assert_eq!(master.break_state(), CeState::Maybe);
    }

    #[test]
    fn xblock_move_up_keeps_only_return_and_result() {
        let mut e = EventList::new();
        e.set_init(0);
        e.set_exit();
        e.set_return();
        e.set_result();
        e.set_break(1);
        e.prepare_move_up_xblock();
        assert_eq!(e.ret, CeState::Yes);
        assert_eq!(e.result, CeState::Yes);
        assert_eq!(e.exit, CeState::No);
        assert_eq!(e.init(0), CeState::No);
        assert_eq!(e.break_state(), CeState::No);
    }

    #[test]
    fn counting_certain_inits() {
        let mut e = EventList::new();
        e.set_init(0);
        e.set_init(5);
        assert_eq!(e.count_certain_inits().unwrap(), 2);
        e.raise_init(7, CeState::Maybe);
        assert!(e.count_certain_inits().is_err());
    }
}
