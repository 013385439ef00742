//! Reconstruction of the payouts a pool actually made.
//!
//! The ledger reports a non-cumulative base payout per checkpoint. When a
//! settled checkpoint has no winner its base rolls forward and is paid on top of
//! the next checkpoint that does have one. A settled `Final` without a winner has
//! nowhere left to roll, so everything carried into it is earmarked for equal
//! distribution across cell holders instead.

use crate::{
    error::{
        Error,
        Result,
    },
    types::{
        Address,
        Amount,
        Checkpoint,
        QuarterRecord,
        WinnerRecord,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointInput {
    pub checkpoint: Checkpoint,
    pub winner: Option<Address>,
    pub base_payout: Amount,
    pub settled: bool,
}

impl CheckpointInput {
    pub fn from_records(quarter: &QuarterRecord, winner: &WinnerRecord) -> Result<Self> {
        if quarter.checkpoint != winner.checkpoint {
            return Err(Error::validation(format!(
                "score record for {} paired with winner record for {}",
                quarter.checkpoint, winner.checkpoint
            )));
        }
        Ok(Self {
            checkpoint: quarter.checkpoint,
            winner: winner.winner,
            base_payout: winner.base_payout,
            settled: quarter.settled,
        })
    }

    /// Placeholder for a checkpoint whose records have not been fetched yet.
    pub fn unknown(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            winner: None,
            base_payout: 0,
            settled: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayoutOutcome {
    /// Paid to a single cell holder.
    Winner(Address),
    /// Settled without a winner; the base moved to a later checkpoint.
    RolledOver,
    /// Not settled yet.
    Pending,
    /// Final settled without a winner; shared by all cell holders.
    EqualDistribution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointPayout {
    pub checkpoint: Checkpoint,
    pub base_payout: Amount,
    pub actual: Amount,
    pub outcome: PayoutOutcome,
}

impl CheckpointPayout {
    /// Amount that actually leaves the pot at this checkpoint.
    pub fn disbursed(&self) -> Amount {
        match self.outcome {
            PayoutOutcome::Winner(_) | PayoutOutcome::EqualDistribution => self.actual,
            PayoutOutcome::RolledOver | PayoutOutcome::Pending => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EqualShare {
    pub per_cell: Amount,
    pub remainder: Amount,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settlement {
    payouts: [CheckpointPayout; 4],
    pending_rollover: Amount,
}

impl Settlement {
    pub fn payouts(&self) -> &[CheckpointPayout; 4] {
        &self.payouts
    }

    pub fn payout(&self, checkpoint: Checkpoint) -> &CheckpointPayout {
        &self.payouts[checkpoint.index()]
    }

    pub fn actual_payouts(&self) -> [Amount; 4] {
        self.payouts.map(|p| p.actual)
    }

    pub fn total_disbursed(&self) -> Amount {
        self.payouts.iter().map(CheckpointPayout::disbursed).sum()
    }

    /// Unclaimed money carried forward that no later checkpoint has absorbed yet.
    pub fn pending_rollover(&self) -> Amount {
        self.pending_rollover
    }

    /// Amount earmarked for equal distribution, if Final settled without a winner.
    pub fn equal_distribution(&self) -> Option<Amount> {
        let last = self.payout(Checkpoint::Final);
        matches!(last.outcome, PayoutOutcome::EqualDistribution).then_some(last.actual)
    }

    pub fn equal_share(&self, holders: u32) -> Option<EqualShare> {
        let amount = self.equal_distribution()?;
        if holders == 0 {
            return None;
        }
        let holders = Amount::from(holders);
        Some(EqualShare {
            per_cell: amount / holders,
            remainder: amount % holders,
        })
    }

    pub fn check_against_pot(&self, total_pot: Amount) -> Result<()> {
        let disbursed = self.total_disbursed();
        if disbursed > total_pot {
            return Err(Error::validation(format!(
                "reconstructed payouts {disbursed} exceed the pot {total_pot}"
            )));
        }
        Ok(())
    }
}

/// Recomputes what each checkpoint paid from four records in Q1, Half, Q3,
/// Final order.
pub fn reconstruct(inputs: &[CheckpointInput; 4]) -> Result<Settlement> {
    for (input, expected) in inputs.iter().zip(Checkpoint::ALL) {
        if input.checkpoint != expected {
            return Err(Error::validation(format!(
                "checkpoint records out of order: expected {expected}, got {}",
                input.checkpoint
            )));
        }
    }

    let mut accumulated: Amount = 0;
    let mut payouts = (*inputs).map(|input| CheckpointPayout {
        checkpoint: input.checkpoint,
        base_payout: input.base_payout,
        actual: input.base_payout,
        outcome: PayoutOutcome::Pending,
    });

    for (input, payout) in inputs.iter().zip(payouts.iter_mut()) {
        let winner = input.winner.and_then(Address::non_zero);
        match winner {
            Some(address) => {
                payout.actual = add(input.base_payout, accumulated)?;
                payout.outcome = PayoutOutcome::Winner(address);
                accumulated = 0;
            }
            None if input.settled && input.checkpoint == Checkpoint::Final => {
                payout.actual = add(input.base_payout, accumulated)?;
                payout.outcome = PayoutOutcome::EqualDistribution;
                accumulated = 0;
            }
            None if input.settled => {
                accumulated = add(accumulated, input.base_payout)?;
                payout.outcome = PayoutOutcome::RolledOver;
            }
            None => {}
        }
    }

    Ok(Settlement {
        payouts,
        pending_rollover: accumulated,
    })
}

fn add(a: Amount, b: Amount) -> Result<Amount> {
    a.checked_add(b)
        .ok_or_else(|| Error::validation("payout total overflows"))
}
