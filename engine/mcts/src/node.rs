//! Tree nodes with lock-free statistics and expansion.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

use engine_config::SearchConfig;
use inference::{EvalResult, PositionEval};
use janggi_core::{Board, Move, Side};

use crate::search::SearchError;

/// Penalty added to a node's visit mass while a thread is descending
/// through it, steering sibling threads elsewhere.
pub const VIRTUAL_LOSS: i32 = 3;

/// Exploration weight in the PUCT score.
const PUCT_C: f64 = 3.0;

// Expansion states. Values at or above EXPANDED carry a reader count on
// top: state == EXPANDED + k means k readers hold the children list.
const UNEXPANDED: i32 = 0;
const EXPANDING: i32 = 1;
const WRITE_LOCKED: i32 = 2;
const EXPANDED: i32 = 3;

/// One legal move out of a node: the move, its prior, and a lazily
/// materialized child. The candidate exclusively owns its child.
pub struct SearchCandidate {
    pub mv: Move,
    pub policy: f32,
    child: AtomicPtr<SearchNode>,
}

impl SearchCandidate {
    fn new(mv: Move, policy: f32) -> Self {
        Self {
            mv,
            policy,
            child: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The child, if some descent has materialized it.
    pub fn child(&self) -> Option<&SearchNode> {
        let ptr = self.child.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null child is only freed by release_child (which
            // requires exclusive tree access) or by our own Drop.
            Some(unsafe { &*ptr })
        }
    }

    /// Materialize the child if absent. Exactly one thread's allocation
    /// wins; losers free their draft.
    fn create_child(&self) {
        let fresh = Box::into_raw(Box::new(SearchNode::new()));
        if self
            .child
            .compare_exchange(
                std::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // SAFETY: the pointer came from Box::into_raw just above and was
            // never published.
            drop(unsafe { Box::from_raw(fresh) });
        }
    }

    /// Detach and take ownership of the child subtree (for tree reuse).
    /// Caller must hold the tree exclusively.
    pub fn release_child(&self) -> Option<Box<SearchNode>> {
        let ptr = self.child.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: ownership transfers to the caller; the slot is null
            // now so Drop will not double-free.
            Some(unsafe { Box::from_raw(ptr) })
        }
    }
}

impl Drop for SearchCandidate {
    fn drop(&mut self) {
        let ptr = *self.child.get_mut();
        if !ptr.is_null() {
            // SAFETY: we own the child exclusively during drop.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

/// One node of the search tree.
///
/// `accum_value` accumulates Han-winning mass over `accum_visits` descents,
/// stored as f32 bits for CAS updates. The children vector is written
/// exactly once, by the thread that wins `acquire_expand`; everyone else
/// reads it only after observing an expanded state, which the state
/// machine's acquire/release pairs order correctly.
pub struct SearchNode {
    accum_value: AtomicU32,
    accum_visits: AtomicI32,
    vloss: AtomicI32,
    state: AtomicI32,
    children: UnsafeCell<Vec<SearchCandidate>>,
}

// SAFETY: all shared mutation goes through atomics; the children vector is
// published exactly once via the expansion state machine.
unsafe impl Send for SearchNode {}
unsafe impl Sync for SearchNode {}

impl Default for SearchNode {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchNode {
    pub fn new() -> Self {
        Self {
            accum_value: AtomicU32::new(0.0f32.to_bits()),
            accum_visits: AtomicI32::new(0),
            vloss: AtomicI32::new(0),
            state: AtomicI32::new(UNEXPANDED),
            children: UnsafeCell::new(Vec::new()),
        }
    }

    #[inline]
    pub fn visits(&self) -> i32 {
        self.accum_visits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn value(&self) -> f32 {
        f32::from_bits(self.accum_value.load(Ordering::Acquire))
    }

    #[inline]
    pub fn virtual_loss(&self) -> i32 {
        self.vloss.load(Ordering::Acquire)
    }

    /// Record one descent's result: visit first, then CAS the value in.
    /// Readers may briefly see the new visit with the old value, which the
    /// selection formula tolerates.
    fn add_value(&self, v: f32) {
        self.accum_visits.fetch_add(1, Ordering::AcqRel);
        let mut current = self.accum_value.load(Ordering::Acquire);
        loop {
            let next = (f32::from_bits(current) + v).to_bits();
            match self.accum_value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    // ------------------------------------------------------------------
    // Expansion state machine
    // ------------------------------------------------------------------

    /// Try to become the expander. Returns true on winning the 0 -> 1
    /// transition; returns false once the node is (being made) readable.
    /// Spins while another thread is mid-expansion.
    fn acquire_expand(&self) -> bool {
        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == UNEXPANDED {
                if self
                    .state
                    .compare_exchange_weak(
                        UNEXPANDED,
                        EXPANDING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return true;
                }
            } else if state >= WRITE_LOCKED {
                return false;
            }
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            }
        }
    }

    fn expand_done(&self) {
        self.state.store(EXPANDED, Ordering::Release);
    }

    fn expand_cancel(&self) {
        self.state.store(UNEXPANDED, Ordering::Release);
    }

    fn is_expanded(&self) -> bool {
        self.state.load(Ordering::Acquire) >= WRITE_LOCKED
    }

    /// Enter the children list as a reader (state >= EXPANDED, +1).
    fn read_lock(&self) {
        let mut spins = 0u32;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state >= EXPANDED
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            }
        }
    }

    fn read_unlock(&self) {
        self.state.fetch_sub(1, Ordering::AcqRel);
    }

    /// Candidates of an expanded node. The vector is immutable once the
    /// node leaves the EXPANDING state, so no read lock is needed for
    /// callers that only inspect it.
    pub fn candidates(&self) -> &[SearchCandidate] {
        if self.state.load(Ordering::Acquire) < WRITE_LOCKED {
            return &[];
        }
        // SAFETY: the vector was published by expand_done's release store
        // and is never written again.
        unsafe { &*self.children.get() }
    }

    /// Detach the subtree under `mv`, if any (for tree reuse).
    pub fn take_child(&mut self, mv: &Move) -> Option<Box<SearchNode>> {
        self.candidates()
            .iter()
            .find(|c| c.mv == *mv)
            .and_then(|c| c.release_child())
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// One descent through this node. Returns the backed-up leaf value in
    /// [0, 1] Han-mass.
    ///
    /// Terminal boards never expand; they feed their exact result straight
    /// into the statistics. An unexpanded node is evaluated optimistically
    /// before the expansion race, so the network call stays off the
    /// critical section.
    pub fn expand(
        &self,
        eval: &PositionEval,
        board: &mut Board,
        config: &SearchConfig,
    ) -> Result<f32, SearchError> {
        match board.winner() {
            Some(Side::Cho) => {
                self.add_value(0.0);
                return Ok(0.0);
            }
            Some(Side::Han) => {
                self.add_value(1.0);
                return Ok(1.0);
            }
            None => {}
        }

        let pre_eval = if !self.is_expanded() {
            Some(eval.evaluate(board)?)
        } else {
            None
        };

        if self.acquire_expand() {
            let result = match pre_eval {
                Some(ev) => ev,
                None => match eval.evaluate(board) {
                    Ok(ev) => ev,
                    Err(e) => {
                        self.expand_cancel();
                        return Err(e.into());
                    }
                },
            };

            self.vloss.fetch_add(VIRTUAL_LOSS, Ordering::AcqRel);
            self.create_children(&result, board, config.score_based_bias_rate);
            let value = self.value();
            self.expand_done();
            self.vloss.fetch_sub(VIRTUAL_LOSS, Ordering::AcqRel);
            Ok(value)
        } else {
            self.vloss.fetch_add(VIRTUAL_LOSS, Ordering::AcqRel);
            self.read_lock();
            let best = self.select_candidate(board.to_move());
            let (mv, child) = match best {
                Some(candidate) => {
                    candidate.create_child();
                    let child = candidate.child().expect("child just materialized");
                    (candidate.mv, child)
                }
                None => {
                    // An expanded node always has at least the pass move.
                    self.read_unlock();
                    self.vloss.fetch_sub(VIRTUAL_LOSS, Ordering::AcqRel);
                    return Err(SearchError::EmptyNode);
                }
            };
            self.read_unlock();

            board.play(mv);
            let outcome = child.expand(eval, board, config);
            let _ = board.undo();
            match outcome {
                Ok(value) => {
                    self.add_value(value);
                    self.vloss.fetch_sub(VIRTUAL_LOSS, Ordering::AcqRel);
                    Ok(value)
                }
                Err(e) => {
                    self.vloss.fetch_sub(VIRTUAL_LOSS, Ordering::AcqRel);
                    Err(e)
                }
            }
        }
    }

    /// Fill in the children and this node's first visit from an evaluation.
    /// Runs only inside the EXPANDING state.
    fn create_children(&self, result: &EvalResult, board: &Board, bias_rate: f32) {
        self.accum_visits.fetch_add(1, Ordering::AcqRel);

        // Net values are mover-relative in [-1, 1]; fold them into
        // Han-winning mass in [0, 1].
        let mut value = if board.to_move() == Side::Cho {
            -result.value
        } else {
            result.value
        };
        value = (value + 1.0) * 0.5;

        // Blend in a material-based prior so the tree sees short-term
        // rewards even before the net does.
        let score_bias = board.score_han() - board.score_cho();
        value = value * (1.0 - bias_rate)
            + bias_rate * 0.5 * (1.0 + (score_bias / 14.4).tanh());
        self.accum_value.store(value.to_bits(), Ordering::Release);

        let n = result.policy.len() as f32;
        let mut total = 0.0f32;
        for &(_, p) in &result.policy {
            total += p + bias_rate / n;
        }
        let mut children = Vec::with_capacity(result.policy.len());
        for &(mv, p) in &result.policy {
            let p = (p.max(0.0) + bias_rate / n) / total;
            children.push(SearchCandidate::new(mv, p));
        }

        // SAFETY: we hold the EXPANDING state, so no other thread touches
        // the vector until expand_done publishes it.
        unsafe {
            *self.children.get() = children;
        }
    }

    /// PUCT selection. Candidates without a visited child inherit this
    /// node's statistics; CHO minimizes Han-mass, so its win rate flips.
    /// Ties keep the earliest candidate in generation order.
    fn select_candidate(&self, to_move: Side) -> Option<&SearchCandidate> {
        let mut best: Option<&SearchCandidate> = None;
        let mut best_score = f64::NEG_INFINITY;

        for candidate in self.candidates() {
            let child = candidate.child();
            let live = child.filter(|c| c.visits() != 0);

            let (mut value, c_vloss, c_visits) = match live {
                Some(c) => (c.value(), c.virtual_loss(), c.visits()),
                None => (self.value(), self.virtual_loss(), self.visits()),
            };
            if to_move == Side::Cho {
                value = c_visits as f32 - value;
            }
            let winrate = value / (c_visits + c_vloss) as f32;

            let numerator = f64::from(self.visits() + self.virtual_loss()).sqrt();
            let denom = 1.0 + child.map_or(0, |c| c.visits() + c.virtual_loss()) as f64;
            let puct = f64::from(candidate.policy) * (numerator / denom);
            let score = f64::from(winrate) + PUCT_C * puct;

            if score > best_score {
                best = Some(candidate);
                best_score = score;
            }
        }
        best
    }

    /// Walk the best-visited line and render it as move text.
    pub fn print_best_path(&self) -> String {
        if self.acquire_expand() {
            // It was unexpanded; put it back.
            self.expand_cancel();
            return String::new();
        }

        let mut line = String::new();
        let mut max_visits = 0;
        let mut max_child: Option<&SearchNode> = None;

        self.read_lock();
        for candidate in self.candidates() {
            if let Some(child) = candidate.child() {
                if child.visits() > max_visits {
                    max_visits = child.visits();
                    max_child = Some(child);
                    line = format!("{} ", candidate.mv);
                }
            }
        }
        self.read_unlock();

        if let Some(child) = max_child {
            line.push_str(&child.print_best_path());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_config::{InferenceConfig, RulesConfig};
    use janggi_core::StartLayout;

    fn opening() -> Board {
        Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, RulesConfig::default())
    }

    #[test]
    fn add_value_accumulates_under_contention() {
        let node = SearchNode::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        node.add_value(0.5);
                    }
                });
            }
        });
        assert_eq!(node.visits(), 8000);
        assert!((node.value() - 4000.0).abs() < 1e-1);
    }

    #[test]
    fn only_one_thread_wins_the_expansion_race() {
        use std::sync::atomic::AtomicUsize;

        let node = SearchNode::new();
        let winners = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if node.acquire_expand() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        // Give the losers time to observe the EXPANDING
                        // state before publishing.
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        node.expand_done();
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(node.is_expanded());
    }

    #[test]
    fn expansion_populates_candidates_and_first_visit() {
        let node = SearchNode::new();
        let eval = PositionEval::new(InferenceConfig::default());
        let mut board = opening();
        let config = SearchConfig {
            print_period_ms: 0,
            ..SearchConfig::default()
        };

        let value = node.expand(&eval, &mut board, &config).unwrap();
        assert!((0.0..=1.0).contains(&value));
        assert_eq!(node.visits(), 1);
        assert_eq!(node.candidates().len(), 32);
        assert_eq!(node.virtual_loss(), 0);

        // Priors are normalized.
        let total: f32 = node.candidates().iter().map(|c| c.policy).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn terminal_boards_feed_exact_results() {
        let eval = PositionEval::new(InferenceConfig::default());
        let config = SearchConfig::default();

        let mut board = opening();
        for _ in 0..2 {
            let pass = board
                .legal_moves()
                .iter()
                .copied()
                .find(|m| m.is_pass())
                .unwrap();
            board.play(pass);
        }

        // Han has won; every descent contributes full Han mass.
        let node = SearchNode::new();
        let v = node.expand(&eval, &mut board, &config).unwrap();
        assert_eq!(v, 1.0);
        let v = node.expand(&eval, &mut board, &config).unwrap();
        assert_eq!(v, 1.0);
        assert_eq!(node.visits(), 2);
        assert!((node.value() - 2.0).abs() < 1e-6);
        assert!(node.candidates().is_empty());
    }

    #[test]
    fn child_materialization_is_idempotent() {
        let candidate = SearchCandidate::new(Move::new(0x00, 84, 84, 0x00), 1.0);
        assert!(candidate.child().is_none());

        candidate.create_child();
        let first = candidate.child().unwrap() as *const SearchNode;
        candidate.create_child();
        let second = candidate.child().unwrap() as *const SearchNode;
        assert_eq!(first, second);

        let released = candidate.release_child();
        assert!(released.is_some());
        assert!(candidate.child().is_none());
    }

    #[test]
    fn descents_restore_the_board() {
        let node = SearchNode::new();
        let eval = PositionEval::new(InferenceConfig::default());
        let mut board = opening();
        let reference = board.clone();
        let config = SearchConfig {
            print_period_ms: 0,
            ..SearchConfig::default()
        };

        for _ in 0..20 {
            node.expand(&eval, &mut board, &config).unwrap();
        }
        assert!(board.same_game(&reference));
        assert_eq!(board.play_hash(), reference.play_hash());
    }
}
