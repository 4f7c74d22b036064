use crate::noso::{
    broker::Subscription,
    error::MinerError,
    protocol::Request,
    types::{Event, Solution, StepSent, Topic},
    Cycle, CycleService,
};
use async_trait::async_trait;

/// How a solution is treated relative to the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Found for a block that is no longer current; never sent.
    Stale,
    /// Proof of participation.
    Pop,
    Step,
}

/// Classifies a solution found for `current_block` at `difficulty`.
///
/// Solutions at `chars - 1` only count as steps when the difficulty leaves a
/// remainder mod 10; otherwise that level has no low step.
pub fn classify(solution: &Solution, current_block: Option<u64>, difficulty: u32) -> Verdict {
    if current_block != Some(solution.block) {
        return Verdict::Stale;
    }

    let len = solution.target_len;
    let chars = solution.target_chars;
    if len + 2 <= chars || (len + 1 == chars && difficulty % 10 == 0) {
        Verdict::Pop
    } else {
        Verdict::Step
    }
}

#[derive(Debug, Default)]
struct Current {
    block: Option<u64>,
    step: u32,
    difficulty: u32,
}

/// Turns worker solutions into STEP commands for the current block.
pub struct SolutionManager {
    show_pop: bool,
}

impl SolutionManager {
    pub fn new(show_pop: bool) -> Self {
        Self { show_pop }
    }
}

#[async_trait]
impl CycleService for SolutionManager {
    async fn start(&self, cycle: &Cycle) -> Result<(), MinerError> {
        let pool_data = cycle.broker.subscribe(Topic::PoolData).await?;
        let solutions = cycle.broker.subscribe(Topic::Solution).await?;
        cycle
            .tracker
            .spawn(run(pool_data, solutions, cycle.clone(), self.show_pop));
        Ok(())
    }
}

async fn run(
    mut pool_data: Subscription,
    mut solutions: Subscription,
    cycle: Cycle,
    show_pop: bool,
) {
    let mut current = Current::default();

    loop {
        tokio::select! {
            biased;
            _ = cycle.cancel.cancelled() => break,
            event = pool_data.recv() => match event {
                Some(event) => {
                    if let Some(data) = event.pool_data() {
                        current.block = Some(data.block);
                        current.step = data.step;
                        current.difficulty = data.difficulty;
                    }
                }
                None => break,
            },
            event = solutions.recv() => match event {
                Some(Event::Solution(solution)) => {
                    handle(&solution, &current, &cycle, show_pop).await;
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}

async fn handle(solution: &Solution, current: &Current, cycle: &Cycle, show_pop: bool) {
    let verdict = classify(solution, current.block, current.difficulty);
    match verdict {
        Verdict::Stale => {
            log::debug!(
                target: "solution",
                "Dropping solution for block {}, current block is {:?}",
                solution.block,
                current.block
            );
            return;
        }
        Verdict::Pop if show_pop => log::info!(
            target: "solution",
            "PoP found: block {} length {} (step {})",
            solution.block,
            solution.target_len,
            current.step
        ),
        Verdict::Pop => log::debug!(
            target: "solution",
            "PoP found: block {} length {}",
            solution.block,
            solution.target_len
        ),
        Verdict::Step => log::info!(
            target: "solution",
            "Step found: block {} length {} of {} (step {})",
            solution.block,
            solution.target_len,
            solution.target_chars,
            current.step
        ),
    }

    cycle.send(Request::step(solution)).await;
    let sent = Event::StepSent(StepSent {
        block: solution.block,
        pop: verdict == Verdict::Pop,
    });
    if !cycle.broker.try_publish(sent) {
        log::debug!(target: "solution", "Step counter for block {} not published", solution.block);
    }
}
