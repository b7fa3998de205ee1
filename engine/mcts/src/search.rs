//! The search driver: parallel descents, subtree reuse, async entry point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use engine_config::SearchConfig;
use inference::{EvalError, PositionEval};
use janggi_core::{Board, Move};

use crate::node::SearchNode;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("expanded node has no candidates")]
    EmptyNode,

    #[error("async search worker is gone")]
    WorkerGone,
}

/// Per-candidate outcome of a search: visit count, average Han-winning
/// mass, the network prior, and the move itself.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub visits: i32,
    pub winrate: f32,
    pub prior_policy: f32,
    pub mv: Move,
}

/// The previous search's tree and the board it was computed on.
struct ReuseState {
    root: Option<Box<SearchNode>>,
    board: Board,
}

struct SearchShared {
    config: SearchConfig,
    reuse: Mutex<ReuseState>,
}

struct SearchTask {
    board: Board,
    eval: Arc<PositionEval>,
    visits: u32,
    deadline_ms: u64,
    result_tx: mpsc::Sender<Result<Vec<SearchResult>, SearchError>>,
}

/// Handle to an in-flight [`Search::search_async`] call.
pub struct SearchHandle {
    rx: mpsc::Receiver<Result<Vec<SearchResult>, SearchError>>,
}

impl SearchHandle {
    /// Block until the search finishes.
    pub fn wait(self) -> Result<Vec<SearchResult>, SearchError> {
        self.rx.recv().map_err(|_| SearchError::WorkerGone)?
    }
}

/// The search engine. One engine owns one reusable tree and a small pool
/// of worker threads servicing asynchronous search requests.
pub struct Search {
    shared: Arc<SearchShared>,
    task_tx: Option<mpsc::Sender<SearchTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl Search {
    pub fn new(config: SearchConfig, initial_board: Board) -> Self {
        let shared = Arc::new(SearchShared {
            config,
            reuse: Mutex::new(ReuseState {
                root: None,
                board: initial_board,
            }),
        });

        let (task_tx, task_rx) = mpsc::channel::<SearchTask>();
        let task_rx = Arc::new(Mutex::new(task_rx));

        // A dedicated pool drains async requests; each request runs one
        // full search on its worker.
        let async_workers = config.num_threads.max(1);
        let workers = (0..async_workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let task_rx = Arc::clone(&task_rx);
                std::thread::spawn(move || loop {
                    let task = {
                        let rx = task_rx.lock().expect("task receiver");
                        rx.recv()
                    };
                    match task {
                        Ok(mut task) => {
                            let result = shared.search(
                                &mut task.board,
                                &task.eval,
                                task.visits,
                                task.deadline_ms,
                            );
                            let _ = task.result_tx.send(result);
                        }
                        Err(_) => return,
                    }
                })
            })
            .collect();

        Self {
            shared,
            task_tx: Some(task_tx),
            workers,
        }
    }

    /// Run a search on the caller's thread. Returns one result per root
    /// candidate; the caller picks (usually) the most-visited move.
    pub fn search(
        &self,
        board: &mut Board,
        eval: &PositionEval,
        visits: u32,
        deadline_ms: u64,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.shared.search(board, eval, visits, deadline_ms)
    }

    /// Queue a search onto the worker pool.
    pub fn search_async(
        &self,
        board: &Board,
        eval: Arc<PositionEval>,
        visits: u32,
        deadline_ms: u64,
    ) -> SearchHandle {
        let (result_tx, rx) = mpsc::channel();
        let task = SearchTask {
            board: board.clone(),
            eval,
            visits,
            deadline_ms,
            result_tx,
        };
        if let Some(tx) = &self.task_tx {
            // A send failure leaves the handle to report WorkerGone.
            let _ = tx.send(task);
        }
        SearchHandle { rx }
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        self.task_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl SearchShared {
    /// Recover the subtree for `board` from the previous search, if the
    /// previous board is an ancestor of it: virtually unmake moves until
    /// the plies match, compare, then descend the cached tree along the
    /// unmade moves, promoting each matching child.
    fn recover_root(&self, reuse: &mut ReuseState, board: &mut Board) -> Option<Box<SearchNode>> {
        let cached_root = reuse.root.take()?;
        if reuse.board.movenum() > board.movenum() {
            return None;
        }

        let mut stack: VecDeque<Move> = VecDeque::new();
        while reuse.board.movenum() < board.movenum() {
            match board.undo() {
                Ok(mv) => stack.push_front(mv),
                Err(_) => break,
            }
        }

        let mut root = None;
        if reuse.board.same_game(board) {
            let mut node = Some(cached_root);
            for mv in &stack {
                node = node.and_then(|mut n| n.take_child(mv));
            }
            root = node;
        }

        // Redo the virtual unmakes either way.
        for mv in stack {
            board.play(mv);
        }
        root
    }

    fn search(
        &self,
        board: &mut Board,
        eval: &PositionEval,
        visits: u32,
        deadline_ms: u64,
    ) -> Result<Vec<SearchResult>, SearchError> {
        // Holding the reuse lock for the whole call serializes overlapping
        // searches; they would otherwise fight over one tree.
        let mut reuse = self.reuse.lock().expect("reuse state");

        let root = self
            .recover_root(&mut reuse, board)
            .unwrap_or_else(|| Box::new(SearchNode::new()));
        if root.visits() > 0 {
            debug!(reused_visits = root.visits(), "subtree reuse");
        }

        let runcount = AtomicUsize::new(root.visits().max(0) as usize);
        let target = visits as usize;
        let start = Instant::now();
        let deadline = start + Duration::from_millis(deadline_ms);
        let print_period = Duration::from_millis(self.config.print_period_ms.max(1));
        let mut next_print = start + print_period;

        let config = &self.config;
        let num_threads = config.num_threads.max(1);

        let outcome: Result<(), SearchError> = std::thread::scope(|scope| {
            let root = &root;
            let runcount = &runcount;
            let mut spawned = 0usize;
            let mut local_board = board.clone();

            loop {
                root.expand(eval, &mut local_board, config)?;
                runcount.fetch_add(1, Ordering::AcqRel);

                let now = Instant::now();
                if now > deadline {
                    break;
                }
                if self.config.print_period_ms > 0 && now > next_print {
                    let winrate = root.value() / root.visits().max(1) as f32;
                    info!(
                        winrate,
                        visits = root.visits(),
                        pv = %root.print_best_path(),
                        "search progress"
                    );
                    next_print = now + print_period;
                }

                // Fork helpers gradually (at most one per millisecond) so
                // they do not all pile onto a root that is still expanding.
                while spawned < num_threads - 1 && spawned < runcount.load(Ordering::Acquire) {
                    let mut worker_board = board.clone();
                    scope.spawn(move || {
                        while runcount.load(Ordering::Acquire) < target {
                            if let Err(e) = root.expand(eval, &mut worker_board, config) {
                                warn!(error = %e, "search worker stopped");
                                break;
                            }
                            runcount.fetch_add(1, Ordering::AcqRel);
                            if Instant::now() > deadline {
                                break;
                            }
                        }
                    });
                    spawned += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }

                if runcount.load(Ordering::Acquire) >= target {
                    break;
                }
            }
            Ok(())
        });
        outcome?;

        reuse.board = board.clone();
        let results = analyze(&root);
        reuse.root = Some(root);
        Ok(results)
    }
}

/// Per-candidate statistics of a finished search.
fn analyze(root: &SearchNode) -> Vec<SearchResult> {
    root.candidates()
        .iter()
        .map(|candidate| match candidate.child() {
            Some(child) if child.visits() > 0 => SearchResult {
                visits: child.visits(),
                winrate: child.value() / child.visits() as f32,
                prior_policy: candidate.policy,
                mv: candidate.mv,
            },
            _ => SearchResult {
                visits: 0,
                winrate: 0.0,
                prior_policy: candidate.policy,
                mv: candidate.mv,
            },
        })
        .collect()
}
