//! # Battleship Arena – Server Crate
//!
//! A self-hosted competition arena for player-submitted battleship AIs.
//! Players upload a single C++ source file through an external transport;
//! the arena compiles it in a sandbox, plays it against every other active
//! submission in 1000-game series, keeps a Glicko-2 leaderboard and streams
//! progress to any number of subscribers.
//!
//! The moving parts, leaves first:
//!
//! - [`artifacts`] stages uploaded sources and generates the per-match
//!   driver consumed by the game engine.
//! - [`store`] owns every persistent record (users, submissions, matches,
//!   rating history) and the transactional operations on them.
//! - [`match_runner`] turns a pair of submissions into a compiled
//!   head-to-head binary and a parsed series result.
//! - [`worker`] is the single writer: it drains pending submissions,
//!   compiles each, runs the round-robin and applies rating updates.
//! - [`events`] fans progress and leaderboard changes out to subscribers.
//! - [`ingest`] is the seam the upload transport calls into.
//! - [`web`] exposes the read API and the SSE event stream.
//!
//! Compilation and match execution run under the resource caps of the
//! `sandbox-exec` crate; rating math lives in the pure `glicko2` crate.
//!
//! Concurrency model: upload handlers and read queries run in parallel and
//! touch nothing but the store; all match/rating side effects are serialized
//! through the one worker thread, which takes a non-blocking lock per drain
//! so overlapping ticks skip instead of queueing.

pub mod artifacts;
pub mod configuration;
pub mod events;
pub mod ingest;
pub mod match_runner;
pub mod store;
pub mod web;
pub mod worker;
