//! Read-only view over the validator set.

use lockstep_types::{Address, Height, Proposal, Round};

/// Membership, vote weighting and proposer election for a fixed validator
/// set in its canonical order.
#[derive(Clone, Debug)]
pub struct ValidatorContract {
    validators: Vec<Address>,
}

impl ValidatorContract {
    /// Create a contract over the canonical validator list.
    pub fn new(validators: Vec<Address>) -> Self {
        Self { validators }
    }

    /// The canonical validator list.
    pub fn validators(&self) -> &[Address] {
        &self.validators
    }

    /// Validator-set size.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Membership test.
    pub fn is_validator(&self, address: &Address) -> bool {
        self.validators.contains(address)
    }

    /// Votes that count at a height. Genesis is committed by construction, so
    /// no votes are eligible there and a node's own signed vote is already a
    /// quorum.
    pub fn eligible_votes(&self, height: Height) -> u64 {
        if height == 0 {
            0
        } else {
            self.validators.len() as u64
        }
    }

    /// Deterministic round-robin proposer election for `(height, round)`.
    ///
    /// The index is `((h mod n) + (n − (r mod n))) mod n` in pure integer
    /// arithmetic, which rotates backwards through the list as rounds
    /// advance within a height.
    pub fn proposer(&self, height: Height, round: Round) -> Address {
        let n = self.validators.len() as u64;
        let index = ((height % n) + (n - (round % n))) % n;
        self.validators[index as usize]
    }

    /// Whether a proposal was signed by the validator elected for its
    /// `(height, round)`.
    pub fn is_proposer(&self, proposal: &Proposal) -> bool {
        match proposal.sender() {
            Ok(sender) => sender == self.proposer(proposal.height(), proposal.round()),
            Err(_) => false,
        }
    }
}
