//! Prompt selection and judge score clamping.
//!
//! Prompt choice is a pure index into a fixed per-mode pool so retried or
//! replayed rounds always see the same text.

use crate::models::{BattleMode, RoundScores};

pub const SCORE_MAX: u32 = 100;

const DEBATE_PROMPTS: &[&str] = &[
    "Argue for or against: a decentralized network can outlast the company that launched it.",
    "Defend this position: memory limits make an agent smarter, not weaker.",
    "Take a side: open weights help attackers more than defenders.",
    "Argue for or against: reputation should decay when an agent goes idle.",
    "Defend this position: a judged arena is a fairer test of skill than a benchmark suite.",
];

const SOLVE_PROMPTS: &[&str] = &[
    "A courier visits 4 depots in some order, never repeating one. Depot C must come before A. How many valid routes exist? Show your reasoning.",
    "You have two ropes that each burn in exactly 60 minutes, but unevenly. Measure 45 minutes. Explain the procedure.",
    "Find the smallest positive integer divisible by every number from 1 to 10, and justify each prime factor.",
    "Three switches outside a room control one bulb inside. You may enter once. Identify the switch. Walk through the plan.",
    "A tank fills in 6 hours through pipe A and drains in 9 through pipe B. Both open at once: when is it full? Show the arithmetic.",
];

const RIDDLE_CHAIN_PROMPTS: &[&str] = &[
    "I am taken from a mine and shut in a wooden case, yet used by almost every scholar. What am I? Answer, then pose a harder riddle in the same style.",
    "The more you take of me, the more you leave behind. What am I? Answer, then chain a new riddle about time.",
    "I speak without a mouth and hear without ears. What am I? Answer, then invent a riddle about networks.",
    "What gets wetter the more it dries? Answer, then pose a riddle whose answer is a number.",
    "Forward I am heavy, backward I am not. What am I? Answer, then chain one about mirrors.",
];

const CREATIVE_CLASH_PROMPTS: &[&str] = &[
    "Write a 150-word story where the last sentence reverses the meaning of the first.",
    "Compose a letter from a lighthouse keeper to the storm that will destroy the lighthouse.",
    "Describe a city where sound is currency, in exactly three paragraphs.",
    "Write the product announcement for a machine that forgets things on your behalf.",
    "Tell the same tiny event twice: once as tragedy, once as comedy.",
];

pub fn prompt_pool(mode: BattleMode) -> &'static [&'static str] {
    match mode {
        BattleMode::Debate => DEBATE_PROMPTS,
        BattleMode::Solve => SOLVE_PROMPTS,
        BattleMode::RiddleChain => RIDDLE_CHAIN_PROMPTS,
        BattleMode::CreativeClash => CREATIVE_CLASH_PROMPTS,
    }
}

/// Deterministic prompt for a round: `(round_number - 1) mod pool_len`.
/// Round numbers start at 1; a round number of 0 is treated as 1 rather
/// than panicking on underflow.
pub fn select_prompt(mode: BattleMode, round_number: u32) -> &'static str {
    let pool = prompt_pool(mode);
    let index = (round_number.max(1) as usize - 1) % pool.len();
    pool[index]
}

/// Clamp raw judge output into [0, 100] per side. The judge's reasoning
/// text is not interpreted here; it passes through verbatim elsewhere.
pub fn clamp_judge_scores(raw_challenger: i64, raw_defender: i64) -> RoundScores {
    RoundScores {
        challenger: raw_challenger.clamp(0, SCORE_MAX as i64) as u32,
        defender: raw_defender.clamp(0, SCORE_MAX as i64) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_round_one_is_deterministic() {
        let first = select_prompt(BattleMode::Solve, 1);
        let second = select_prompt(BattleMode::Solve, 1);
        assert_eq!(first, second);
        assert_eq!(first, SOLVE_PROMPTS[0]);
    }

    #[test]
    fn prompts_wrap_around_the_pool() {
        let pool_len = prompt_pool(BattleMode::Debate).len() as u32;
        assert_eq!(
            select_prompt(BattleMode::Debate, 1),
            select_prompt(BattleMode::Debate, pool_len + 1)
        );
        assert_ne!(
            select_prompt(BattleMode::Debate, 1),
            select_prompt(BattleMode::Debate, 2)
        );
    }

    #[test]
    fn zero_round_number_does_not_underflow() {
        assert_eq!(
            select_prompt(BattleMode::RiddleChain, 0),
            select_prompt(BattleMode::RiddleChain, 1)
        );
    }

    #[test]
    fn scores_clamp_to_bounds() {
        let scores = clamp_judge_scores(-20, 350);
        assert_eq!(scores.challenger, 0);
        assert_eq!(scores.defender, 100);

        let scores = clamp_judge_scores(55, 100);
        assert_eq!(scores.challenger, 55);
        assert_eq!(scores.defender, 100);
    }
}
