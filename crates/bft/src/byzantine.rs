//! Deliberately protocol-violating validator strategies.
//!
//! These exist solely to exercise the safety properties under test; the
//! module is compiled only into test builds.

#![cfg(any(test, feature = "byzantine-testing"))]

/// Named fault strategy for a test validator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ByzantineMode {
    /// Honest behavior.
    #[default]
    None,
    /// Sign and gossip two conflicting proposals for the same round.
    DifferentProposal,
    /// Prevote any recorded proposal, ignoring locks and timeouts.
    AlwaysVote,
    /// Prevote and precommit any recorded proposal immediately.
    AlwaysAgree,
    /// Stay silent: never emit anything.
    NoResponse,
    /// Every fault except silence, combined.
    Combined,
}

/// Flag view of a [`ByzantineMode`], matched by the round state machine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Strategy {
    /// Emit two conflicting proposals.
    pub different_proposal: bool,
    /// Vote without honoring locks or timeouts.
    pub always_vote: bool,
    /// Vote and precommit immediately on any proposal.
    pub always_agree: bool,
    /// Emit nothing at all.
    pub no_response: bool,
}

impl ByzantineMode {
    /// The behavior flags this mode enables.
    pub fn strategy(&self) -> Strategy {
        match self {
            ByzantineMode::None => Strategy::default(),
            ByzantineMode::DifferentProposal => Strategy {
                different_proposal: true,
                ..Strategy::default()
            },
            ByzantineMode::AlwaysVote => Strategy {
                always_vote: true,
                ..Strategy::default()
            },
            ByzantineMode::AlwaysAgree => Strategy {
                always_agree: true,
                ..Strategy::default()
            },
            ByzantineMode::NoResponse => Strategy {
                no_response: true,
                ..Strategy::default()
            },
            ByzantineMode::Combined => Strategy {
                different_proposal: true,
                always_vote: true,
                always_agree: true,
                no_response: false,
            },
        }
    }
}
