//! Staging of submission sources and generation of match sources.
//!
//! Two file trees are involved: the canonical upload tree
//! (`<upload>/<username>/<filename>`), which is the durable copy, and the
//! engine staging tree (`<engine>/src`, `<engine>/build`), which is what the
//! compiler actually consumes. Everything under the engine tree can be
//! re-materialized from the canonical tree, so a wiped engine checkout only
//! costs a re-stage.
//!
//! Submissions follow a naming convention in two places: the file must be
//! called `memory_functions_<tag>.cpp`, and the source must define the three
//! entry points `initMemory<S>`, `smartMove<S>` and `updateMemory<S>` for a
//! common suffix `<S>`. The suffix is detected by scanning for the
//! `initMemory<S>(` definition; the generated header declares the other two
//! from it.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, bail};
use regex::Regex;
use tracing::debug;

/// Extract the `<tag>` from a `memory_functions_<tag>.cpp` filename.
pub fn submission_prefix(filename: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^memory_functions_(\w+)\.cpp$").unwrap());
    re.captures(filename).map(|c| c[1].to_string())
}

/// Extract the function suffix from an `initMemory<S>(` definition.
///
/// Tolerates whitespace between the return type, name and parameter list;
/// anything fancier than that is the compiler's problem.
pub fn function_suffix(source: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"void\s+initMemory(\w+)\s*\(").unwrap());
    re.captures(source).map(|c| c[1].to_string())
}

/// File layout for canonical uploads and engine staging.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_root: PathBuf,
    engine_root: PathBuf,
}

impl ArtifactStore {
    /// Store rooted at the given upload and engine directories.
    pub fn new(upload_root: impl Into<PathBuf>, engine_root: impl Into<PathBuf>) -> Self {
        ArtifactStore {
            upload_root: upload_root.into(),
            engine_root: engine_root.into(),
        }
    }

    /// Create the upload root and the engine `src`/`build` directories.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.upload_root)
            .with_context(|| format!("creating upload dir {:?}", self.upload_root))?;
        std::fs::create_dir_all(self.engine_src())
            .with_context(|| format!("creating engine src dir under {:?}", self.engine_root))?;
        std::fs::create_dir_all(self.engine_build())
            .with_context(|| format!("creating engine build dir under {:?}", self.engine_root))?;
        Ok(())
    }

    /// `<engine>/src`
    pub fn engine_src(&self) -> PathBuf {
        self.engine_root.join("src")
    }

    /// `<engine>/build`
    pub fn engine_build(&self) -> PathBuf {
        self.engine_root.join("build")
    }

    /// Durable copy of a user's upload.
    pub fn canonical_path(&self, username: &str, filename: &str) -> PathBuf {
        self.upload_root.join(username).join(filename)
    }

    /// Staged copy consumed by the compiler.
    pub fn staged_path(&self, filename: &str) -> PathBuf {
        self.engine_src().join(filename)
    }

    /// Write the canonical copy of an upload, replacing any previous one.
    pub fn write_canonical(
        &self,
        username: &str,
        filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        let user_dir = self.upload_root.join(username);
        std::fs::create_dir_all(&user_dir)
            .with_context(|| format!("creating user dir {user_dir:?}"))?;
        let path = user_dir.join(filename);
        std::fs::write(&path, bytes).with_context(|| format!("writing {path:?}"))?;
        Ok(())
    }

    /// Copy a submission from the canonical tree into the engine staging
    /// tree and write its generated header. Returns the detected function
    /// suffix.
    pub fn stage_submission(&self, username: &str, filename: &str) -> anyhow::Result<String> {
        let prefix = submission_prefix(filename)
            .with_context(|| format!("invalid filename format: {filename}"))?;

        let canonical = self.canonical_path(username, filename);
        let source = std::fs::read_to_string(&canonical)
            .with_context(|| format!("reading canonical source {canonical:?}"))?;

        let Some(suffix) = function_suffix(&source) else {
            bail!("could not find initMemory function in {filename}");
        };
        debug!(%prefix, %suffix, "staging submission source");

        std::fs::create_dir_all(self.engine_src()).context("creating engine src dir")?;
        let staged = self.staged_path(filename);
        std::fs::write(&staged, &source).with_context(|| format!("writing {staged:?}"))?;

        let header_filename = format!("memory_functions_{prefix}.h");
        let header_path = self.engine_src().join(&header_filename);
        std::fs::write(&header_path, generate_header(&header_filename, &suffix))
            .with_context(|| format!("writing {header_path:?}"))?;

        Ok(suffix)
    }

    /// Re-materialize an opponent's staged source if it is missing.
    ///
    /// Fails when the canonical copy is gone too, in which case the caller
    /// skips that opponent.
    pub fn ensure_staged(&self, username: &str, filename: &str) -> anyhow::Result<()> {
        if self.staged_path(filename).exists() {
            return Ok(());
        }
        self.stage_submission(username, filename).map(|_| ())
    }

    /// Write the generated driver for a `prefix1` vs `prefix2` match and
    /// return its path.
    pub fn write_match_driver(
        &self,
        prefix1: &str,
        prefix2: &str,
        suffix1: &str,
        suffix2: &str,
    ) -> anyhow::Result<PathBuf> {
        let path = self
            .engine_src()
            .join(format!("match_{prefix1}_vs_{prefix2}.cpp"));
        std::fs::write(&path, generate_match_driver(prefix1, prefix2, suffix1, suffix2))
            .with_context(|| format!("writing match driver {path:?}"))?;
        Ok(path)
    }

    /// Path of the compiled match binary for a pair of prefixes.
    pub fn match_binary_path(&self, prefix1: &str, prefix2: &str) -> PathBuf {
        self.engine_build()
            .join(format!("match_{prefix1}_vs_{prefix2}"))
    }

    /// The engine's game implementation, linked into every match binary.
    pub fn engine_game_source(&self) -> PathBuf {
        self.engine_src().join("battleship_light.cpp")
    }
}

/// Header declaring the three entry points of one submission.
fn generate_header(filename: &str, suffix: &str) -> String {
    let guard = filename.replace('.', "_").to_uppercase();
    let suffix = capitalize(suffix);
    format!(
        "#ifndef {guard}\n\
         #define {guard}\n\
         \n\
         #include \"memory.h\"\n\
         #include \"battleship_light.h\"\n\
         #include <string>\n\
         \n\
         void initMemory{suffix}(ComputerMemory &memory);\n\
         std::string smartMove{suffix}(const ComputerMemory &memory);\n\
         void updateMemory{suffix}(int row, int col, int result, ComputerMemory &memory);\n\
         \n\
         #endif\n"
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Driver template; `@P1@`/`@P2@` are filename prefixes, `@S1@`/`@S2@` the
/// function suffixes. The emitted program is the wire contract with the
/// engine: it prints `PLAYER1_WINS`/`PLAYER2_WINS`/`TIES`/`TOTAL_MOVES`/
/// `AVG_MOVES` as `key=value` lines on stdout.
const MATCH_DRIVER_TEMPLATE: &str = r#"#include "battleship_light.h"
#include "memory.h"
#include "memory_functions_@P1@.h"
#include "memory_functions_@P2@.h"
#include <iostream>
#include <cstdlib>
#include <ctime>

using namespace std;

struct MatchResult {
    int player1Wins = 0;
    int player2Wins = 0;
    int ties = 0;
    int totalMoves = 0;
};

MatchResult runMatch(int numGames) {
    MatchResult result;
    srand(time(NULL));

    for (int game = 0; game < numGames; game++) {
        Board board1, board2;
        ComputerMemory memory1, memory2;

        initializeBoard(board1);
        initializeBoard(board2);
        initMemory@S1@(memory1);
        initMemory@S2@(memory2);

        int shipsSunk1 = 0;
        int shipsSunk2 = 0;
        int moveCount = 0;

        while (true) {
            moveCount++;

            string move1 = smartMove@S1@(memory1);
            int row1, col1;
            int check1 = checkMove(move1, board2, row1, col1);
            while (check1 != VALID_MOVE) {
                move1 = randomMove();
                check1 = checkMove(move1, board2, row1, col1);
            }

            string move2 = smartMove@S2@(memory2);
            int row2, col2;
            int check2 = checkMove(move2, board1, row2, col2);
            while (check2 != VALID_MOVE) {
                move2 = randomMove();
                check2 = checkMove(move2, board1, row2, col2);
            }

            int result1 = playMove(row1, col1, board2);
            int result2 = playMove(row2, col2, board1);

            updateMemory@S1@(row1, col1, result1, memory1);
            updateMemory@S2@(row2, col2, result2, memory2);

            if (isASunk(result1)) shipsSunk1++;
            if (isASunk(result2)) shipsSunk2++;

            if (shipsSunk1 == 5 || shipsSunk2 == 5) {
                break;
            }
        }

        result.totalMoves += moveCount;

        if (shipsSunk1 == 5 && shipsSunk2 == 5) {
            result.ties++;
        } else if (shipsSunk1 == 5) {
            result.player1Wins++;
        } else {
            result.player2Wins++;
        }
    }

    return result;
}

int main(int argc, char* argv[]) {
    if (argc < 2) {
        cerr << "Usage: " << argv[0] << " <num_games>" << endl;
        return 1;
    }

    int numGames = atoi(argv[1]);
    if (numGames <= 0) numGames = 10;

    setDebugMode(false);

    MatchResult result = runMatch(numGames);

    cout << "PLAYER1_WINS=" << result.player1Wins << endl;
    cout << "PLAYER2_WINS=" << result.player2Wins << endl;
    cout << "TIES=" << result.ties << endl;
    cout << "TOTAL_MOVES=" << result.totalMoves << endl;
    cout << "AVG_MOVES=" << (result.totalMoves / numGames) << endl;

    return 0;
}
"#;

fn generate_match_driver(prefix1: &str, prefix2: &str, suffix1: &str, suffix2: &str) -> String {
    MATCH_DRIVER_TEMPLATE
        .replace("@P1@", prefix1)
        .replace("@P2@", prefix2)
        .replace("@S1@", suffix1)
        .replace("@S2@", suffix2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_accepts_convention() {
        assert_eq!(
            submission_prefix("memory_functions_alice.cpp").as_deref(),
            Some("alice")
        );
        assert_eq!(
            submission_prefix("memory_functions_a2_b.cpp").as_deref(),
            Some("a2_b")
        );
    }

    #[test]
    fn prefix_rejects_everything_else() {
        assert!(submission_prefix("main.cpp").is_none());
        assert!(submission_prefix("memory_functions_.cpp").is_none());
        assert!(submission_prefix("memory_functions_alice.cpp.bak").is_none());
        assert!(submission_prefix("x_memory_functions_alice.cpp").is_none());
        assert!(submission_prefix("memory_functions_a b.cpp").is_none());
    }

    #[test]
    fn suffix_scan_tolerates_whitespace() {
        let source = "void\tinitMemoryAlice  (ComputerMemory &m) {}";
        assert_eq!(function_suffix(source).as_deref(), Some("Alice"));
    }

    #[test]
    fn suffix_scan_requires_init_memory() {
        let source = "std::string smartMoveAlice(const ComputerMemory &m);";
        assert!(function_suffix(source).is_none());
    }

    #[test]
    fn header_declares_all_three_entry_points() {
        let header = generate_header("memory_functions_alice.h", "Alice");
        assert!(header.contains("#ifndef MEMORY_FUNCTIONS_ALICE_H"));
        assert!(header.contains("void initMemoryAlice(ComputerMemory &memory);"));
        assert!(header.contains("std::string smartMoveAlice(const ComputerMemory &memory);"));
        assert!(header
            .contains("void updateMemoryAlice(int row, int col, int result, ComputerMemory &memory);"));
    }

    #[test]
    fn driver_wires_both_players() {
        let driver = generate_match_driver("alice", "bob", "Alice", "Bob");
        assert!(driver.contains("#include \"memory_functions_alice.h\""));
        assert!(driver.contains("#include \"memory_functions_bob.h\""));
        assert!(driver.contains("initMemoryAlice(memory1);"));
        assert!(driver.contains("initMemoryBob(memory2);"));
        assert!(driver.contains("smartMoveAlice(memory1);"));
        assert!(driver.contains("updateMemoryBob(row2, col2, result2, memory2);"));
        assert!(driver.contains("PLAYER1_WINS="));
    }

    #[test]
    fn staging_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("uploads"), tmp.path().join("engine"));
        store.ensure_layout().unwrap();

        store
            .write_canonical(
                "alice",
                "memory_functions_alice.cpp",
                b"void initMemoryAlice(ComputerMemory &m) {}",
            )
            .unwrap();

        let suffix = store
            .stage_submission("alice", "memory_functions_alice.cpp")
            .unwrap();
        assert_eq!(suffix, "Alice");
        assert!(store.staged_path("memory_functions_alice.cpp").exists());
        assert!(store.engine_src().join("memory_functions_alice.h").exists());
    }

    #[test]
    fn staging_without_init_memory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("uploads"), tmp.path().join("engine"));
        store.ensure_layout().unwrap();
        store
            .write_canonical("bob", "memory_functions_bob.cpp", b"int main() {}")
            .unwrap();

        assert!(store
            .stage_submission("bob", "memory_functions_bob.cpp")
            .is_err());
    }

    #[test]
    fn ensure_staged_skips_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("uploads"), tmp.path().join("engine"));
        store.ensure_layout().unwrap();
        // Staged file exists without a canonical copy: nothing to do.
        std::fs::write(store.staged_path("memory_functions_x.cpp"), b"whatever").unwrap();
        store
            .ensure_staged("ghost", "memory_functions_x.cpp")
            .unwrap();
    }

    #[test]
    fn ensure_staged_fails_without_canonical() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("uploads"), tmp.path().join("engine"));
        store.ensure_layout().unwrap();
        assert!(store
            .ensure_staged("ghost", "memory_functions_x.cpp")
            .is_err());
    }
}
