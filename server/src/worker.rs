//! The submission worker: the single writer of match and rating state.
//!
//! One OS thread owns the whole pipeline. It wakes on a 10-second tick or
//! on an ingest signal, takes a non-blocking drain lock (a second trigger
//! while a drain is running just skips), and then processes pending
//! submissions strictly in upload order: compile check, then a round-robin
//! against every active completed opponent the submission has not yet
//! faced. Matches, rating updates and history points are all written from
//! here, which is what makes the check-then-insert on the unordered match
//! pair race-free.
//!
//! Cancellation is cooperative: the shutdown flag is checked between
//! submissions and between matches, so the current match always finishes
//! and a partially processed queue is simply picked up by the next start.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::Context;
use glicko2::MatchResult;
use parking_lot::Mutex;
use sandbox_exec::{Outcome, Sandbox};
use tracing::{error, info, instrument, warn};

use crate::artifacts::{ArtifactStore, submission_prefix};
use crate::events::{ArenaEvent, EventBus};
use crate::match_runner::{MatchRunner, SeriesTotals};
use crate::store::{Store, Submission, SubmissionStatus};

/// Games per head-to-head series.
pub const GAMES_PER_MATCH: u32 = 1000;
/// Poll interval when no ingest signal arrives.
pub const TICK: Duration = Duration::from_secs(10);
/// Deadline for the single-file compile check.
const COMPILE_CHECK_TIMEOUT: Duration = Duration::from_secs(60);
/// Entries carried in a leaderboard event.
const LEADERBOARD_LIMIT: usize = 50;

/// Owns the drain loop; constructed once and moved onto its thread.
pub struct Worker {
    store: Store,
    artifacts: ArtifactStore,
    sandbox: Box<dyn Sandbox>,
    bus: EventBus,
    drain_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        store: Store,
        artifacts: ArtifactStore,
        sandbox: Box<dyn Sandbox>,
        bus: EventBus,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Worker {
            store,
            artifacts,
            sandbox,
            bus,
            drain_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Drain once at startup, then on every tick or wake signal until the
    /// shutdown flag is set or the wake channel closes.
    pub fn run(self, wake: Receiver<()>) {
        info!("submission worker started");
        self.try_drain();
        loop {
            match wake.recv_timeout(TICK) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    self.try_drain();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("submission worker stopped");
    }

    /// Run one drain unless another is already in progress.
    pub fn try_drain(&self) -> bool {
        let Some(_guard) = self.drain_lock.try_lock() else {
            return false;
        };
        if let Err(e) = self.drain_pending() {
            error!("worker error: {e:#}");
        }
        true
    }

    /// Process every pending submission in upload order.
    pub fn drain_pending(&self) -> anyhow::Result<()> {
        let pending = self
            .store
            .pending_submissions()
            .context("listing pending submissions")?;
        if pending.is_empty() {
            return Ok(());
        }

        for submission in pending {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.process(&submission)?;
        }

        if self.store.queued_player_names()?.is_empty() {
            self.bus.emit(ArenaEvent::Complete);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(player = %submission.username, id = submission.id))]
    fn process(&self, submission: &Submission) -> anyhow::Result<()> {
        info!("compiling {} ({})", submission.username, submission.filename);
        self.store
            .set_status(submission.id, SubmissionStatus::Testing)?;

        if let Err(e) = self.compile_check(submission) {
            warn!("compilation failed for {}: {e:#}", submission.username);
            self.store
                .set_status(submission.id, SubmissionStatus::CompilationFailed)?;
            self.publish_leaderboard();
            return Ok(());
        }

        info!("compiled {}", submission.username);
        self.store
            .set_status(submission.id, SubmissionStatus::Completed)?;
        self.publish_leaderboard();

        self.round_robin(submission)?;
        self.publish_leaderboard();
        Ok(())
    }

    /// Stage the source and syntax-check it in isolation (`-c` only; the
    /// real link happens per match).
    fn compile_check(&self, submission: &Submission) -> anyhow::Result<()> {
        let prefix = submission_prefix(&submission.filename)
            .with_context(|| format!("invalid filename format: {}", submission.filename))?;
        self.artifacts
            .stage_submission(&submission.username, &submission.filename)?;

        let object = self.artifacts.engine_build().join(format!("ai_{prefix}.o"));
        let argv = vec![
            "g++".to_string(),
            "-std=c++11".to_string(),
            "-c".to_string(),
            "-O3".to_string(),
            "-I".to_string(),
            self.artifacts.engine_src().to_string_lossy().into_owned(),
            "-o".to_string(),
            object.to_string_lossy().into_owned(),
            self.artifacts
                .staged_path(&submission.filename)
                .to_string_lossy()
                .into_owned(),
        ];

        let exec = self
            .sandbox
            .run(&format!("compile-{prefix}"), &argv, COMPILE_CHECK_TIMEOUT);
        match exec.outcome {
            Outcome::Success => Ok(()),
            Outcome::Timeout => anyhow::bail!("compilation timed out"),
            _ => anyhow::bail!(
                "compilation failed: {}",
                exec.output.lines().next().unwrap_or_default()
            ),
        }
    }

    /// Match the fresh submission against every active completed opponent
    /// it has not faced yet. Per-opponent failures are logged and skipped;
    /// only queries that make the whole phase meaningless propagate.
    fn round_robin(&self, submission: &Submission) -> anyhow::Result<()> {
        let opponents = self
            .store
            .active_completed_submissions()
            .context("listing opponents")?;

        let mut unplayed = Vec::new();
        for opponent in opponents {
            if opponent.id == submission.id {
                continue;
            }
            match self.store.has_valid_match_between(submission.id, opponent.id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("error checking match history: {e:#}");
                    continue;
                }
            }
            if let Err(e) = self
                .artifacts
                .ensure_staged(&opponent.username, &opponent.filename)
            {
                warn!("skipping opponent {}: {e:#}", opponent.username);
                continue;
            }
            unplayed.push(opponent);
        }

        if unplayed.is_empty() {
            info!(
                "no new opponents for {}, all matches already played",
                submission.username
            );
            return Ok(());
        }

        info!(
            "starting round-robin for {} ({} opponents)",
            submission.username,
            unplayed.len()
        );
        let total = unplayed.len();
        let started = Instant::now();
        let runner = MatchRunner::new(self.sandbox.as_ref(), &self.artifacts);

        for (i, opponent) in unplayed.iter().enumerate() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let current = i + 1;
            self.publish_progress(&submission.username, current, total, started);

            let totals = runner.run(submission, opponent, GAMES_PER_MATCH);
            if totals.is_null() {
                warn!(
                    "[{current}/{total}] no result for {} vs {}, skipping",
                    submission.username, opponent.username
                );
                continue;
            }

            if let Err(e) = self.settle_match(submission, opponent, totals, current, total) {
                warn!("failed to store match result: {e:#}");
            }
        }

        info!(
            "round-robin complete for {} ({} matches)",
            submission.username, total
        );
        Ok(())
    }

    /// Record the match and apply both rating updates, challenger first.
    fn settle_match(
        &self,
        challenger: &Submission,
        opponent: &Submission,
        totals: SeriesTotals,
        current: usize,
        total: usize,
    ) -> anyhow::Result<()> {
        let avg_moves = totals.total_moves / u64::from(GAMES_PER_MATCH);

        let winner_id = if totals.player1_wins > totals.player2_wins {
            info!(
                "[{current}/{total}] {} defeats {} ({}-{}, {avg_moves} moves avg)",
                challenger.username, opponent.username, totals.player1_wins, totals.player2_wins
            );
            challenger.id
        } else if totals.player2_wins > totals.player1_wins {
            info!(
                "[{current}/{total}] {} defeats {} ({}-{}, {avg_moves} moves avg)",
                opponent.username, challenger.username, totals.player2_wins, totals.player1_wins
            );
            opponent.id
        } else {
            // Even series: move-count parity decides.
            let winner_id = if totals.total_moves % 2 == 0 {
                challenger.id
            } else {
                opponent.id
            };
            info!(
                "[{current}/{total}] tie {}-{}, coin flip winner: {}",
                totals.player1_wins,
                totals.player2_wins,
                if winner_id == challenger.id {
                    &challenger.username
                } else {
                    &opponent.username
                }
            );
            winner_id
        };

        let match_id = self.store.record_match(
            challenger.id,
            opponent.id,
            winner_id,
            totals.player1_wins,
            totals.player2_wins,
            avg_moves,
            avg_moves,
        )?;

        // Both updates start from the pre-match triples; ties dilute the
        // score ratio only by exclusion.
        let decisive = f64::from(totals.player1_wins + totals.player2_wins);
        let challenger_score = f64::from(totals.player1_wins) / decisive;
        let opponent_score = f64::from(totals.player2_wins) / decisive;

        let challenger_rating = self.store.submission_rating(challenger.id)?;
        let opponent_rating = self.store.submission_rating(opponent.id)?;

        let challenger_new = glicko2::rate(
            challenger_rating,
            &[MatchResult::new(opponent_rating, challenger_score)],
        );
        let opponent_new = glicko2::rate(
            opponent_rating,
            &[MatchResult::new(challenger_rating, opponent_score)],
        );

        self.store.update_rating(challenger.id, challenger_new)?;
        self.store.update_rating(opponent.id, opponent_new)?;
        self.store
            .append_rating_history(challenger.id, match_id, challenger_new)?;
        self.store
            .append_rating_history(opponent.id, match_id, opponent_new)?;
        Ok(())
    }

    fn publish_progress(&self, player: &str, current: usize, total: usize, started: Instant) {
        let queued_players = self
            .store
            .queued_player_names()
            .unwrap_or_default()
            .into_iter()
            .filter(|name| name != player)
            .collect();

        let elapsed = started.elapsed().as_secs_f64();
        let eta_seconds = (elapsed / current as f64 * (total - current) as f64) as u64;

        self.bus.emit(ArenaEvent::Progress {
            player: player.to_string(),
            current_match: current,
            total_matches: total,
            percent_complete: current as f64 / total as f64 * 100.0,
            eta_seconds,
            queued_players,
        });
    }

    fn publish_leaderboard(&self) {
        match self.store.leaderboard(LEADERBOARD_LIMIT) {
            Ok(entries) => self.bus.emit(ArenaEvent::Leaderboard { entries }),
            Err(e) => warn!("failed to build leaderboard event: {e:#}"),
        }
    }
}
