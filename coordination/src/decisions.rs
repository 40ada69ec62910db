//! Collective decisions: rule voting and trust-game pairing.
//!
//! Both are triggered by a quorum of submissions and evaluated per group.
//! The functions here are pure given an RNG; the round state feeds them the
//! recorded ballots and broadcasts the results.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::registry::{ParticipantId, TrustGameDecision};

/// A rule participants can vote for
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rule(pub String);

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one group's vote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSelection {
    /// Every rule with support, most votes first; the first entry wins ties
    pub selected: Vec<Rule>,
    pub tally: BTreeMap<Rule, u32>,
}

impl RuleSelection {
    pub fn winner(&self) -> Option<&Rule> {
        self.selected.first()
    }
}

/// Tally a group's ballots. Rules with equal support are ordered randomly.
pub fn tally_votes<'a, R, I>(ballots: I, rng: &mut R) -> RuleSelection
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = &'a Rule>,
{
    let mut tally: BTreeMap<Rule, u32> = BTreeMap::new();
    for rule in ballots {
        *tally.entry(rule.clone()).or_insert(0) += 1;
    }

    let mut ranked: Vec<(&Rule, u32)> = tally.iter().map(|(rule, n)| (rule, *n)).collect();
    ranked.shuffle(rng);
    // Stable sort keeps the shuffled order among equal counts.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let selected = ranked.into_iter().map(|(rule, _)| rule.clone()).collect();

    RuleSelection { selected, tally }
}

/// Pair members sequentially; an odd last member is paired with the first.
pub fn pair_in_order(order: &[ParticipantId]) -> Vec<(ParticipantId, ParticipantId)> {
    let mut pairs: Vec<(ParticipantId, ParticipantId)> = order
        .chunks(2)
        .filter_map(|chunk| match chunk {
            [a, b] => Some((*a, *b)),
            _ => None,
        })
        .collect();
    if order.len() % 2 == 1 && order.len() > 1 {
        pairs.push((order[order.len() - 1], order[0]));
    }
    pairs
}

/// Shuffle a group's members and pair them for the trust game.
pub fn pair_trust_game<R: Rng + ?Sized>(
    members: &[ParticipantId],
    rng: &mut R,
) -> Vec<(ParticipantId, ParticipantId)> {
    let mut order = members.to_vec();
    order.shuffle(rng);
    pair_in_order(&order)
}

/// Player one's endowment
pub const TRUST_GAME_ENDOWMENT: f64 = 1.0;

/// Multiplier applied to the amount player one sends
pub const TRUST_GAME_MULTIPLIER: f64 = 3.0;

/// Outcome of one trust-game pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustGameResult {
    pub player_one: ParticipantId,
    pub player_two: ParticipantId,
    pub sent: f64,
    /// What player two kept of the tripled amount
    pub kept: f64,
    pub player_one_earnings: f64,
    pub player_two_earnings: f64,
}

/// Compute the payoff for one pair.
///
/// Player one keeps a share of the endowment in quarter steps and sends the
/// rest, which is tripled. Player two's strategy lists how much to keep for
/// each possible amount received (0.25, 0.5, 0.75, 1.0 sent).
pub fn trust_game_payoff(
    player_one: ParticipantId,
    one: &TrustGameDecision,
    player_two: ParticipantId,
    two: &TrustGameDecision,
) -> TrustGameResult {
    let keep = quarter(one.player_one_keep.clamp(0.0, TRUST_GAME_ENDOWMENT));
    let sent = TRUST_GAME_ENDOWMENT - keep;
    let received = sent * TRUST_GAME_MULTIPLIER;

    let step = (sent * 4.0).round() as usize;
    let kept = match step {
        0 => 0.0,
        n => two
            .player_two_keeps
            .get(n - 1)
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, received),
    };

    TrustGameResult {
        player_one,
        player_two,
        sent,
        kept,
        player_one_earnings: keep + received - kept,
        player_two_earnings: kept,
    }
}

fn quarter(value: f64) -> f64 {
    (value * 4.0).round() / 4.0
}
