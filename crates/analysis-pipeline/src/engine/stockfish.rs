//! Stockfish engine wrapper using UCI protocol (async I/O)

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use tracing::debug;

use super::{Engine, EngineFactory, EngineRequest, EngineResponse};
use crate::config::EngineSettings;
use crate::error::PipelineError;
use crate::model::{PvLine, Score};

/// Bound on the `uci`/`isready` handshake of a fresh process
const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawns configured Stockfish processes
#[derive(Clone, Debug)]
pub struct StockfishFactory {
    path: String,
    threads: u32,
    hash_mb: u32,
}

impl StockfishFactory {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            path: settings.path.clone(),
            threads: settings.threads,
            hash_mb: settings.hash_mb,
        }
    }
}

impl EngineFactory for StockfishFactory {
    type Engine = StockfishEngine;

    async fn spawn(&self) -> Result<StockfishEngine, PipelineError> {
        let started = tokio::time::timeout(
            ENGINE_READY_TIMEOUT,
            StockfishEngine::new(&self.path, self.threads, self.hash_mb),
        )
        .await;
        match started {
            Ok(result) => result,
            Err(_) => Err(PipelineError::EngineUnavailable(format!(
                "Stockfish at {} not ready within {ENGINE_READY_TIMEOUT:?}",
                self.path
            ))),
        }
    }
}

/// Stockfish engine instance
pub struct StockfishEngine {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    multipv: u32,
}

impl StockfishEngine {
    /// Spawn a new Stockfish process and initialize UCI
    pub async fn new(path: &str, threads: u32, hash_mb: u32) -> Result<Self, PipelineError> {
        let mut process = Command::new(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| PipelineError::EngineUnavailable(format!("Failed to spawn Stockfish: {e}")))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| PipelineError::EngineUnavailable("Stockfish stdin not captured".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| PipelineError::EngineUnavailable("Stockfish stdout not captured".into()))?;

        let mut engine = Self {
            process,
            stdin,
            stdout: BufReader::new(stdout),
            multipv: 1,
        };

        engine
            .handshake(threads, hash_mb)
            .await
            .map_err(|e| PipelineError::EngineUnavailable(format!("UCI handshake failed: {e}")))?;

        Ok(engine)
    }

    async fn handshake(&mut self, threads: u32, hash_mb: u32) -> Result<(), PipelineError> {
        self.send("uci").await?;
        self.wait_for("uciok").await?;

        // Configure for analysis
        self.send(&format!("setoption name Threads value {threads}")).await?;
        self.send(&format!("setoption name Hash value {hash_mb}")).await?;
        self.send("setoption name UCI_AnalyseMode value true").await?;
        self.send("isready").await?;
        self.wait_for("readyok").await
    }

    /// Send a command to Stockfish
    async fn send(&mut self, cmd: &str) -> Result<(), PipelineError> {
        debug!(cmd, "SF <");
        self.stdin
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .map_err(|e| PipelineError::EngineFailure(format!("Failed to write to Stockfish: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| PipelineError::EngineFailure(format!("Failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Read one trimmed line; EOF means the process went away
    async fn read_line(&mut self, line: &mut String) -> Result<(), PipelineError> {
        line.clear();
        let n = self
            .stdout
            .read_line(line)
            .await
            .map_err(|e| PipelineError::EngineFailure(format!("Failed to read from Stockfish: {e}")))?;
        if n == 0 {
            return Err(PipelineError::EngineFailure("Stockfish closed its output".into()));
        }
        let trimmed_len = line.trim_end().len();
        line.truncate(trimmed_len);
        Ok(())
    }

    /// Wait for a specific response line
    async fn wait_for(&mut self, expected: &str) -> Result<(), PipelineError> {
        let mut line = String::new();
        loop {
            self.read_line(&mut line).await?;
            debug!(line = line.as_str(), "SF >");
            if line.trim() == expected {
                return Ok(());
            }
        }
    }

    async fn set_multipv(&mut self, multipv: u32) -> Result<(), PipelineError> {
        if self.multipv != multipv {
            self.send(&format!("setoption name MultiPV value {multipv}")).await?;
            self.multipv = multipv;
        }
        Ok(())
    }

    /// Send quit command and wait for process to exit
    pub async fn quit(&mut self) {
        let _ = self.send("quit").await;
        let _ = self.process.wait().await;
    }
}

impl Engine for StockfishEngine {
    async fn evaluate(&mut self, request: &EngineRequest) -> Result<EngineResponse, PipelineError> {
        let limits = request.limits;
        let multipv = limits.multipv.max(1);

        self.set_multipv(multipv).await?;
        self.send(&format!("position fen {}", request.fen)).await?;
        self.send(&go_command(limits.movetime_ms, limits.depth)).await?;

        let mut slots = PvSlots::new(multipv);
        let mut line = String::new();

        let best_move = loop {
            self.read_line(&mut line).await?;
            let trimmed = line.trim();

            if trimmed.starts_with("info") && trimmed.contains(" score ") {
                slots.record(trimmed);
            } else if trimmed.starts_with("bestmove") {
                break trimmed
                    .split_whitespace()
                    .nth(1)
                    .filter(|m| *m != "(none)" && *m != "0000")
                    .map(String::from);
            }
        };

        let depth = slots.depth;
        let lines = slots.into_lines();
        if lines.is_empty() {
            return Err(PipelineError::EngineFailure(format!(
                "no score reported for {}",
                request.fen
            )));
        }

        Ok(EngineResponse {
            lines,
            best_move,
            depth,
        })
    }

    async fn quit(&mut self) {
        StockfishEngine::quit(self).await;
    }
}

impl Drop for StockfishEngine {
    fn drop(&mut self) {
        // Best-effort synchronous kill in drop
        let _ = self.process.start_kill();
    }
}

/// MultiPV lines of the deepest iteration reported so far.
///
/// A rank-1 line at a new depth starts a new iteration and drops the
/// lower ranks of the previous one, so all kept lines share one depth.
#[derive(Debug)]
struct PvSlots {
    slots: Vec<Option<PvLine>>,
    depth: Option<u32>,
}

impl PvSlots {
    fn new(multipv: u32) -> Self {
        Self {
            slots: vec![None; multipv.max(1) as usize],
            depth: None,
        }
    }

    fn record(&mut self, line: &str) {
        let rank = parse_multipv_index(line).unwrap_or(1).max(1);
        let score = match (parse_cp(line), parse_mate(line)) {
            (_, Some(mate)) => Score::Mate(mate),
            (Some(cp), None) => Score::Cp(cp),
            (None, None) => return,
        };
        let line_depth = parse_depth(line);

        if rank == 1 {
            if line_depth > self.depth {
                self.slots.iter_mut().for_each(|slot| *slot = None);
                self.depth = line_depth;
            }
        } else if line_depth.is_some() && line_depth != self.depth {
            return;
        }

        if let Some(slot) = self.slots.get_mut(rank as usize - 1) {
            *slot = Some(PvLine {
                rank,
                score,
                moves: parse_pv(line),
            });
        }
    }

    fn into_lines(self) -> Vec<PvLine> {
        self.slots.into_iter().flatten().collect()
    }
}

fn go_command(movetime_ms: u64, depth: Option<u32>) -> String {
    match depth {
        Some(d) => format!("go depth {d} movetime {movetime_ms}"),
        None => format!("go movetime {movetime_ms}"),
    }
}

/// Value following `key` in an info line
fn parse_field<T: std::str::FromStr>(line: &str, key: &str) -> Option<T> {
    let mut parts = line.split_whitespace();
    while let Some(part) = parts.next() {
        if part == key {
            return parts.next()?.parse().ok();
        }
    }
    None
}

/// Parse centipawn score from info line
fn parse_cp(line: &str) -> Option<i32> {
    parse_field(line, "cp")
}

/// Parse mate score from info line
fn parse_mate(line: &str) -> Option<i32> {
    parse_field(line, "mate")
}

/// Parse multipv index from info line
fn parse_multipv_index(line: &str) -> Option<u32> {
    parse_field(line, "multipv")
}

fn parse_depth(line: &str) -> Option<u32> {
    parse_field(line, "depth")
}

/// Parse PV moves from info line
fn parse_pv(line: &str) -> Vec<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut in_pv = false;
    let mut moves = Vec::new();

    for part in parts {
        if part == "pv" {
            in_pv = true;
            continue;
        }
        if in_pv {
            // PV ends at next keyword or end of line
            if part.starts_with("bmc") || part == "string" {
                break;
            }
            moves.push(part.to_string());
        }
    }

    moves
}
