#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_pipeline::{
    Engine, EngineFactory, EnginePool, EngineRequest, EngineResponse, EngineSettings,
    MemoryStore, Pipeline, PipelineConfig, PipelineError, PvLine, RetryPolicy, Score,
    SearchLimits, Thresholds,
};
use chess_core::{replay, MoveSequence};

pub const GAME: i64 = 1;

/// 1.e4 e5 2.f3 Nc6 3.g4
pub const GAME_MOVES: [&str; 5] = ["e2e4", "e7e5", "f2f3", "b8c6", "g2g4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    Fast,
    Deep,
}

#[derive(Debug, Clone)]
pub enum Answer {
    /// Ranked lines, best first
    Lines(Vec<PvLine>),
    /// Search breaks down (I/O or protocol failure)
    Fail,
    /// Engine reports itself unusable
    Unavailable,
}

#[derive(Default)]
struct ScriptState {
    answers: HashMap<(String, Pass), Answer>,
    delay: Duration,
    pass_delay: HashMap<Pass, Duration>,
    down: bool,
    searches: usize,
    spawns: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Canned engine answers keyed by FEN and pass. Unscripted positions score
/// 0 with no best move.
#[derive(Clone, Default)]
pub struct Script(Arc<Mutex<ScriptState>>);

impl Script {
    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.0.lock().unwrap()
    }

    pub fn set(&self, fen: &str, pass: Pass, answer: Answer) {
        self.state().answers.insert((fen.to_string(), pass), answer);
    }

    /// Single line `score` with `best` as its first move.
    pub fn score(&self, fen: &str, pass: Pass, score: Score, best: &str) {
        self.lines(fen, pass, &[(score, best)]);
    }

    pub fn lines(&self, fen: &str, pass: Pass, lines: &[(Score, &str)]) {
        let lines = lines
            .iter()
            .enumerate()
            .map(|(i, (score, mv))| PvLine {
                rank: i as u32 + 1,
                score: *score,
                moves: vec![mv.to_string()],
            })
            .collect();
        self.set(fen, pass, Answer::Lines(lines));
    }

    /// Same single-line answer for both passes.
    pub fn both(&self, fen: &str, score: Score, best: &str) {
        self.score(fen, Pass::Fast, score, best);
        self.score(fen, Pass::Deep, score, best);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// Delay for one pass only, overriding `set_delay`.
    pub fn set_pass_delay(&self, pass: Pass, delay: Duration) {
        self.state().pass_delay.insert(pass, delay);
    }

    /// While down, no engine process can be started.
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    pub fn searches(&self) -> usize {
        self.state().searches
    }

    pub fn spawns(&self) -> usize {
        self.state().spawns
    }

    /// Most searches ever running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }
}

pub struct ScriptedFactory {
    script: Script,
}

pub struct ScriptedEngine {
    script: Script,
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    async fn spawn(&self) -> Result<ScriptedEngine, PipelineError> {
        let mut state = self.script.state();
        if state.down {
            return Err(PipelineError::EngineUnavailable("scripted engine is down".into()));
        }
        state.spawns += 1;
        Ok(ScriptedEngine {
            script: self.script.clone(),
        })
    }
}

impl Engine for ScriptedEngine {
    async fn evaluate(&mut self, request: &EngineRequest) -> Result<EngineResponse, PipelineError> {
        let pass = if request.limits.multipv > 1 {
            Pass::Deep
        } else {
            Pass::Fast
        };
        let (answer, delay) = {
            let mut state = self.script.state();
            state.searches += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            let answer = state.answers.get(&(request.fen.clone(), pass)).cloned();
            let delay = state.pass_delay.get(&pass).copied().unwrap_or(state.delay);
            (answer, delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.script.state().in_flight -= 1;

        let lines = match answer {
            Some(Answer::Lines(lines)) => lines,
            Some(Answer::Fail) => {
                return Err(PipelineError::EngineFailure(format!("scripted failure at {}", request.fen)))
            }
            Some(Answer::Unavailable) => {
                return Err(PipelineError::EngineUnavailable("scripted outage".into()))
            }
            None => vec![PvLine {
                rank: 1,
                score: Score::Cp(0),
                moves: vec![],
            }],
        };

        Ok(EngineResponse {
            best_move: lines.first().and_then(|l| l.moves.first().cloned()),
            lines,
            depth: Some(match pass {
                Pass::Fast => 8,
                Pass::Deep => 20,
            }),
        })
    }

    async fn quit(&mut self) {}
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        engine: EngineSettings {
            path: "scripted".into(),
            threads: 1,
            hash_mb: 16,
            pool_size: 2,
            fast: SearchLimits {
                movetime_ms: 1,
                depth: None,
                multipv: 1,
            },
            deep: SearchLimits {
                movetime_ms: 2,
                depth: None,
                multipv: 3,
            },
            response_timeout: Duration::from_millis(500),
            acquire_timeout: Duration::from_secs(2),
        },
        thresholds: Thresholds {
            brilliant_cp: 900,
            great_cp: 600,
            inaccuracy_cp: -100,
            mistake_cp: -150,
            blunder_cp: -300,
            near_best_tolerance_cp: 10,
            mate_score_cp: 10_000,
        },
        retry: RetryPolicy {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        },
        deep_candidates: vec![
            analysis_pipeline::Category::Mistake,
            analysis_pipeline::Category::Blunder,
            analysis_pipeline::Category::Brilliant,
        ],
    }
}

pub struct Harness {
    pub pipeline: Pipeline<MemoryStore, ScriptedFactory>,
    pub script: Script,
    /// FEN of every position, index 0 = start
    pub fens: Vec<String>,
}

impl Harness {
    pub async fn new(moves: &[&str]) -> Self {
        Self::with_config(moves, test_config()).await
    }

    pub async fn with_config(moves: &[&str], config: PipelineConfig) -> Self {
        let script = Script::default();
        let game = MoveSequence::from_notations(GAME, moves.iter().copied());
        let fens = replay(&game.plies)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.fen)
            .collect();

        let store = MemoryStore::new();
        store.insert_game(game).await;

        let pool = EnginePool::from_settings(
            ScriptedFactory {
                script: script.clone(),
            },
            &config.engine,
        );
        let pipeline = Pipeline::new(Arc::new(store), Arc::new(pool), Arc::new(config));

        Self {
            pipeline,
            script,
            fens,
        }
    }

    /// Store another game and return the FEN of each of its positions.
    pub async fn add_game(&self, game_id: i64, moves: &[&str]) -> Vec<String> {
        let game = MoveSequence::from_notations(game_id, moves.iter().copied());
        let fens = replay(&game.plies)
            .unwrap()
            .into_iter()
            .map(|p| p.fen)
            .collect();
        self.store().insert_game(game).await;
        fens
    }

    pub fn store(&self) -> &MemoryStore {
        self.pipeline.store()
    }

    pub fn fen(&self, index: usize) -> &str {
        &self.fens[index]
    }

    /// Fast and deep answers for the blunder game:
    /// ply 3 (2.f3) loses 435 and ply 5 (3.g4) loses 490, all else is quiet.
    pub fn script_blunder_game(&self) {
        let s = &self.script;
        s.both(self.fen(0), Score::Cp(20), "e2e4");
        s.both(self.fen(1), Score::Cp(-20), "e7e5");
        s.score(self.fen(2), Pass::Fast, Score::Cp(15), "g1f3");
        s.lines(
            self.fen(2),
            Pass::Deep,
            &[
                (Score::Cp(15), "g1f3"),
                (Score::Cp(15), "b1c3"),
                (Score::Cp(5), "d2d4"),
            ],
        );
        s.both(self.fen(3), Score::Cp(420), "d8h4");
        s.both(self.fen(4), Score::Cp(-410), "d2d4");
        s.both(self.fen(5), Score::Cp(900), "d8h4");
    }
}
