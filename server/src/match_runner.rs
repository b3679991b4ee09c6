//! Head-to-head execution of one match between two staged submissions.
//!
//! A match is: generate the driver source for the pair, compile driver +
//! engine + both submissions into one binary inside the sandbox, run it for
//! the requested number of games, and parse the `key=value` summary it
//! prints. Any failure along the way collapses to the null series
//! `(0, 0, 0)`; the worker treats that as "nothing happened" so a broken
//! match can never leak into the rating graph.

use std::time::Duration;

use anyhow::{Context, bail};
use sandbox_exec::{Outcome, Sandbox};
use tracing::{instrument, trace, warn};

use crate::artifacts::{ArtifactStore, submission_prefix, function_suffix};
use crate::store::Submission;

/// Deadline for linking the combined match binary.
const COMPILE_TIMEOUT: Duration = Duration::from_secs(120);
/// Deadline for playing the full series (1000 games normally finish in
/// about a minute; this leaves generous headroom).
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Aggregated result of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeriesTotals {
    pub player1_wins: u32,
    pub player2_wins: u32,
    pub ties: u32,
    pub total_moves: u64,
}

impl SeriesTotals {
    /// A series with no decisive games; never recorded or rated. Covers
    /// both "could not run" and the all-ties pathology, which are not
    /// distinguishable from the outside.
    pub fn is_null(&self) -> bool {
        self.player1_wins == 0 && self.player2_wins == 0
    }
}

/// Runs matches through a [`Sandbox`] against staged artifacts.
pub struct MatchRunner<'a> {
    sandbox: &'a dyn Sandbox,
    artifacts: &'a ArtifactStore,
}

impl<'a> MatchRunner<'a> {
    pub fn new(sandbox: &'a dyn Sandbox, artifacts: &'a ArtifactStore) -> Self {
        MatchRunner { sandbox, artifacts }
    }

    /// Play `num_games` games of `player1` vs `player2`.
    ///
    /// Returns the null series on any failure; the reason is logged here
    /// and the caller only needs to check [`SeriesTotals::is_null`].
    #[instrument(skip_all, fields(vs = %format!("[{} VS {}]", player1.username, player2.username)))]
    pub fn run(&self, player1: &Submission, player2: &Submission, num_games: u32) -> SeriesTotals {
        match self.try_run(player1, player2, num_games) {
            Ok(totals) => {
                trace!(?totals, "series finished");
                totals
            }
            Err(e) => {
                warn!("match failed: {e:#}");
                SeriesTotals::default()
            }
        }
    }

    fn try_run(
        &self,
        player1: &Submission,
        player2: &Submission,
        num_games: u32,
    ) -> anyhow::Result<SeriesTotals> {
        let prefix1 = submission_prefix(&player1.filename)
            .with_context(|| format!("invalid filename {}", player1.filename))?;
        let prefix2 = submission_prefix(&player2.filename)
            .with_context(|| format!("invalid filename {}", player2.filename))?;

        let source1 = self.staged_source(&player1.filename)?;
        let source2 = self.staged_source(&player2.filename)?;
        let suffix1 = function_suffix(&source1)
            .with_context(|| format!("no initMemory function in {}", player1.filename))?;
        let suffix2 = function_suffix(&source2)
            .with_context(|| format!("no initMemory function in {}", player2.filename))?;

        let driver = self
            .artifacts
            .write_match_driver(&prefix1, &prefix2, &suffix1, &suffix2)?;
        let binary = self.artifacts.match_binary_path(&prefix1, &prefix2);

        let mut compile_argv = vec![
            "g++".to_string(),
            "-std=c++11".to_string(),
            "-O3".to_string(),
            "-o".to_string(),
            binary.to_string_lossy().into_owned(),
            driver.to_string_lossy().into_owned(),
            self.artifacts.engine_game_source().to_string_lossy().into_owned(),
            self.artifacts
                .staged_path(&player1.filename)
                .to_string_lossy()
                .into_owned(),
        ];
        // Self-play: the source must not be listed twice.
        if prefix1 != prefix2 {
            compile_argv.push(
                self.artifacts
                    .staged_path(&player2.filename)
                    .to_string_lossy()
                    .into_owned(),
            );
        }

        let compile = self
            .sandbox
            .run("compile-match", &compile_argv, COMPILE_TIMEOUT);
        match compile.outcome {
            Outcome::Success => {}
            Outcome::Timeout => bail!("match binary compilation timed out"),
            _ => bail!(
                "failed to compile match binary: {}",
                first_line(&compile.output)
            ),
        }

        let run_argv = vec![binary.to_string_lossy().into_owned(), num_games.to_string()];
        let run = self.sandbox.run("run-match", &run_argv, RUN_TIMEOUT);
        match run.outcome {
            Outcome::Success => {}
            Outcome::Timeout => bail!("match execution timed out"),
            _ => bail!("match execution failed: {}", first_line(&run.output)),
        }

        Ok(parse_match_output(&run.output))
    }

    fn staged_source(&self, filename: &str) -> anyhow::Result<String> {
        let path = self.artifacts.staged_path(filename);
        std::fs::read_to_string(&path)
            .with_context(|| format!("staged source missing: {path:?}"))
    }
}

fn first_line(output: &str) -> &str {
    output.lines().next().unwrap_or_default()
}

/// Parse the driver's `key=value` summary lines; unknown lines are ignored.
pub fn parse_match_output(output: &str) -> SeriesTotals {
    let mut totals = SeriesTotals::default();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key {
                "PLAYER1_WINS" => totals.player1_wins = value.trim().parse().unwrap_or(0),
                "PLAYER2_WINS" => totals.player2_wins = value.trim().parse().unwrap_or(0),
                "TIES" => totals.ties = value.trim().parse().unwrap_or(0),
                "TOTAL_MOVES" => totals.total_moves = value.trim().parse().unwrap_or(0),
                // AVG_MOVES is derived from TOTAL_MOVES; anything else is
                // stray submission output.
                _ => {}
            }
        }
    }
    totals
}
