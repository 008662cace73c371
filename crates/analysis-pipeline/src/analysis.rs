//! Move classification, pure functions only
//! (no engine or store dependencies)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::model::{EvaluationResult, MoveHighlight, PassKind, Score};

/// Centipawns subtracted per move of mate distance
const MATE_DISTANCE_STEP: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Brilliant,
    Great,
    Best,
    Inaccuracy,
    Mistake,
    Blunder,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Brilliant,
        Category::Great,
        Category::Best,
        Category::Inaccuracy,
        Category::Mistake,
        Category::Blunder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Brilliant => "brilliant",
            Category::Great => "great",
            Category::Best => "best",
            Category::Inaccuracy => "inaccuracy",
            Category::Mistake => "mistake",
            Category::Blunder => "blunder",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

/// Map a score onto a bounded centipawn scale.
///
/// Mate scores sit above every centipawn score and shrink with distance,
/// never below `mate_score_cp / 2`. Centipawn scores are clamped to that
/// same bound.
pub fn normalize_score(score: Score, mate_score_cp: i32) -> i32 {
    let bound = mate_score_cp / 2;
    match score {
        Score::Cp(cp) => cp.clamp(-bound, bound),
        Score::Mate(0) => -mate_score_cp,
        Score::Mate(n) => {
            let magnitude = (mate_score_cp - n.abs().saturating_mul(MATE_DISTANCE_STEP)).max(bound);
            if n > 0 {
                magnitude
            } else {
                -magnitude
            }
        }
    }
}

/// Category for a move's evaluation delta. All boundaries are inclusive;
/// losses are checked before gains.
pub fn classify(delta_cp: i32, is_best_move: bool, thresholds: &Thresholds) -> Option<Category> {
    let tol = thresholds.near_best_tolerance_cp;

    if delta_cp <= thresholds.blunder_cp {
        Some(Category::Blunder)
    } else if delta_cp <= thresholds.mistake_cp {
        Some(Category::Mistake)
    } else if delta_cp <= thresholds.inaccuracy_cp {
        Some(Category::Inaccuracy)
    } else if delta_cp >= thresholds.brilliant_cp && !is_best_move {
        Some(Category::Brilliant)
    } else if delta_cp >= thresholds.great_cp {
        Some(Category::Great)
    } else if delta_cp >= -tol && (is_best_move || delta_cp <= tol) {
        Some(Category::Best)
    } else {
        None
    }
}

/// Evaluation change of one move, from the mover's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveGrade {
    pub eval_before_cp: i32,
    pub eval_after_cp: i32,
    pub delta_cp: i32,
    pub is_best_move: bool,
}

/// `before` is the position the mover faced, `after` the one handed to the
/// opponent, so its score is negated.
pub fn grade_move(
    before: &EvaluationResult,
    after: &EvaluationResult,
    played_move: &str,
    mate_score_cp: i32,
) -> MoveGrade {
    let eval_before_cp = normalize_score(before.score, mate_score_cp);
    let eval_after_cp = -normalize_score(after.score, mate_score_cp);
    let is_best_move = before
        .top_moves(mate_score_cp)
        .iter()
        .any(|m| m == played_move);

    MoveGrade {
        eval_before_cp,
        eval_after_cp,
        delta_cp: eval_after_cp - eval_before_cp,
        is_best_move,
    }
}

/// Grade and classify ply `after.ply`; `None` when the move is unremarkable.
pub fn highlight_for(
    game_id: i64,
    played_move: &str,
    before: &EvaluationResult,
    after: &EvaluationResult,
    thresholds: &Thresholds,
    source: PassKind,
) -> Option<MoveHighlight> {
    let grade = grade_move(before, after, played_move, thresholds.mate_score_cp);
    let category = classify(grade.delta_cp, grade.is_best_move, thresholds)?;

    Some(MoveHighlight {
        game_id,
        ply: after.ply,
        category,
        played_move: played_move.to_string(),
        eval_before_cp: grade.eval_before_cp,
        eval_after_cp: grade.eval_after_cp,
        eval_delta_cp: grade.delta_cp,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PvLine;

    fn thresholds() -> Thresholds {
        Thresholds {
            brilliant_cp: 900,
            great_cp: 600,
            inaccuracy_cp: -100,
            mistake_cp: -150,
            blunder_cp: -300,
            near_best_tolerance_cp: 10,
            mate_score_cp: 10_000,
        }
    }

    fn eval(ply: u32, score: Score, best: &str) -> EvaluationResult {
        EvaluationResult {
            ply,
            score,
            best_move: Some(best.to_string()),
            lines: vec![PvLine {
                rank: 1,
                score,
                moves: vec![best.to_string()],
            }],
            depth: Some(12),
            movetime_ms: 40,
            pass: PassKind::Fast,
        }
    }

    #[test]
    fn test_classify_boundaries_inclusive() {
        let t = thresholds();
        assert_eq!(classify(-300, false, &t), Some(Category::Blunder));
        assert_eq!(classify(-299, false, &t), Some(Category::Mistake));
        assert_eq!(classify(-150, false, &t), Some(Category::Mistake));
        assert_eq!(classify(-149, false, &t), Some(Category::Inaccuracy));
        assert_eq!(classify(-100, false, &t), Some(Category::Inaccuracy));
        assert_eq!(classify(-99, false, &t), None);
        assert_eq!(classify(600, false, &t), Some(Category::Great));
        assert_eq!(classify(900, false, &t), Some(Category::Brilliant));
    }

    #[test]
    fn test_classify_top_move_is_never_brilliant() {
        let t = thresholds();
        assert_eq!(classify(950, true, &t), Some(Category::Great));
        assert_eq!(classify(950, false, &t), Some(Category::Brilliant));
    }

    #[test]
    fn test_classify_best_and_near_best() {
        let t = thresholds();
        assert_eq!(classify(0, false, &t), Some(Category::Best));
        assert_eq!(classify(-10, false, &t), Some(Category::Best));
        assert_eq!(classify(-11, true, &t), None);
        assert_eq!(classify(40, true, &t), Some(Category::Best));
        assert_eq!(classify(40, false, &t), None);
        assert_eq!(classify(-50, false, &t), None);
    }

    #[test]
    fn test_classify_is_pure() {
        let t = thresholds();
        for delta in [-1000, -300, -120, 0, 15, 700, 1200] {
            assert_eq!(classify(delta, false, &t), classify(delta, false, &t));
        }
    }

    #[test]
    fn test_normalize_mate_scores() {
        assert_eq!(normalize_score(Score::Mate(1), 10_000), 9_990);
        assert_eq!(normalize_score(Score::Mate(-3), 10_000), -9_970);
        assert_eq!(normalize_score(Score::Mate(0), 10_000), -10_000);
        assert_eq!(normalize_score(Score::Mate(900), 10_000), 5_000);
        assert_eq!(normalize_score(Score::Cp(7_000), 10_000), 5_000);
        assert_eq!(normalize_score(Score::Cp(-35), 10_000), -35);
    }

    #[test]
    fn test_grade_uses_mover_perspective() {
        // White to move at +15; after the move black is to move at +420
        let before = eval(2, Score::Cp(15), "d2d4");
        let after = eval(3, Score::Cp(420), "d8h4");
        let grade = grade_move(&before, &after, "f2f3", 10_000);
        assert_eq!(grade.eval_before_cp, 15);
        assert_eq!(grade.eval_after_cp, -420);
        assert_eq!(grade.delta_cp, -435);
        assert!(!grade.is_best_move);

        let h = highlight_for(9, "f2f3", &before, &after, &thresholds(), PassKind::Fast).unwrap();
        assert_eq!(h.ply, 3);
        assert_eq!(h.category, Category::Blunder);
    }

    #[test]
    fn test_grade_allowing_mate_is_blunder() {
        let before = eval(10, Score::Cp(30), "e1g1");
        let after = eval(11, Score::Mate(2), "h4h2");
        let grade = grade_move(&before, &after, "g2g4", 10_000);
        assert_eq!(grade.delta_cp, -9_980 - 30);
        assert_eq!(classify(grade.delta_cp, false, &thresholds()), Some(Category::Blunder));
    }

    #[test]
    fn test_category_round_trip_names() {
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
        assert!("good".parse::<Category>().is_err());
    }
}
