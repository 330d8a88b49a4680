//! Elo rating math and winner determination.
//!
//! Pure functions only; the battle engine owns when they are applied.

use crate::models::Battle;

/// Standard chess K-factor; every shard uses the same one.
pub const K_FACTOR: f64 = 32.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EloDelta {
    pub winner: i32,
    pub loser: i32,
}

/// Logistic expected score for `own` against `other`.
fn expected_score(own: u32, other: u32) -> f64 {
    1.0 / (1.0 + 10f64.powf((other as f64 - own as f64) / 400.0))
}

/// Compute the rating deltas for one match result.
///
/// Non-draw: winner gets `round(K * (1 - E_w))` (>= 0), loser gets
/// `round(K * (0 - E_l))` (<= 0). A draw scores both sides against a 0.5
/// target, so a draw between mismatched ratings still drags them toward
/// each other. In the draw case `winner_rating`/`loser_rating` are just
/// the two sides in a fixed order.
pub fn compute_elo_delta(winner_rating: u32, loser_rating: u32, is_draw: bool) -> EloDelta {
    let expected_winner = expected_score(winner_rating, loser_rating);
    let expected_loser = expected_score(loser_rating, winner_rating);

    if is_draw {
        EloDelta {
            winner: (K_FACTOR * (0.5 - expected_winner)).round() as i32,
            loser: (K_FACTOR * (0.5 - expected_loser)).round() as i32,
        }
    } else {
        EloDelta {
            winner: (K_FACTOR * (1.0 - expected_winner)).round() as i32,
            loser: (K_FACTOR * (0.0 - expected_loser)).round() as i32,
        }
    }
}

/// Sum each side's round scores; the strictly greater total wins, equal
/// totals are a draw. Only meaningful once every round has been judged.
pub fn determine_winner(battle: &Battle) -> Option<String> {
    let mut challenger_total: u64 = 0;
    let mut defender_total: u64 = 0;
    for round in &battle.rounds {
        challenger_total += round.scores.challenger as u64;
        defender_total += round.scores.defender as u64;
    }

    if challenger_total > defender_total {
        Some(battle.challenger.shard_id.clone())
    } else if defender_total > challenger_total {
        Some(battle.defender.shard_id.clone())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Battle, BattleMode, BattleRound, BattleStatus, Participant, RoundScores,
    };

    fn battle_with_scores(rounds: &[(u32, u32)]) -> Battle {
        Battle {
            id: "b1".into(),
            mode: BattleMode::Debate,
            status: BattleStatus::Active,
            challenger: Participant {
                owner_id: "owner-a".into(),
                shard_id: "shard-a".into(),
                rating_at_start: 1200,
                rating_delta: 0,
            },
            defender: Participant {
                owner_id: "owner-b".into(),
                shard_id: "shard-b".into(),
                rating_at_start: 1200,
                rating_delta: 0,
            },
            rounds: rounds
                .iter()
                .enumerate()
                .map(|(i, (c, d))| BattleRound {
                    round_number: i as u32 + 1,
                    prompt: String::new(),
                    challenger_response: "x".into(),
                    defender_response: "y".into(),
                    scores: RoundScores {
                        challenger: *c,
                        defender: *d,
                    },
                    reasoning: None,
                })
                .collect(),
            winner_shard_id: None,
            stake_amount: 0.0,
            escrow_ref: None,
            settlement_ref: None,
            finalization_ref: None,
            created_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn equal_ratings_split_k_evenly() {
        let delta = compute_elo_delta(1200, 1200, false);
        assert_eq!(delta.winner, 16);
        assert_eq!(delta.loser, -16);
    }

    #[test]
    fn winner_never_loses_points() {
        for (w, l) in [(1000u32, 2000u32), (2000, 1000), (1500, 1500), (800, 2400)] {
            let delta = compute_elo_delta(w, l, false);
            assert!(delta.winner >= 0, "winner delta for {w} vs {l}");
            assert!(delta.loser <= 0, "loser delta for {w} vs {l}");
        }
    }

    #[test]
    fn upset_pays_more_than_expected_win() {
        let upset = compute_elo_delta(1000, 1400, false);
        let routine = compute_elo_delta(1400, 1000, false);
        assert!(upset.winner > routine.winner);
    }

    #[test]
    fn draw_between_equals_moves_nothing() {
        let delta = compute_elo_delta(1300, 1300, true);
        assert_eq!(delta.winner, 0);
        assert_eq!(delta.loser, 0);
    }

    #[test]
    fn draw_between_mismatched_ratings_favors_underdog() {
        // Higher-rated side passed first: it was expected to win, so a
        // draw costs it points and pays the underdog.
        let delta = compute_elo_delta(1600, 1200, true);
        assert!(delta.winner < 0);
        assert!(delta.loser > 0);
        assert_eq!(delta.winner, -delta.loser);
    }

    #[test]
    fn three_round_debate_sums_decide_winner() {
        // 80/70/60 = 210 vs 60/80/50 = 190.
        let battle = battle_with_scores(&[(80, 60), (70, 80), (60, 50)]);
        assert_eq!(determine_winner(&battle).as_deref(), Some("shard-a"));
    }

    #[test]
    fn equal_sums_are_a_draw() {
        let battle = battle_with_scores(&[(70, 60), (50, 60)]);
        assert_eq!(determine_winner(&battle), None);
    }

    #[test]
    fn no_rounds_is_a_draw() {
        let battle = battle_with_scores(&[]);
        assert_eq!(determine_winner(&battle), None);
    }
}
