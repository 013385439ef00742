#![allow(non_snake_case)]
use squares::{
    controller::{
        WinningCell,
        fetch_pool_view,
    },
    settlement::{
        EqualShare,
        PayoutOutcome,
    },
    test_helpers::{
        ALICE,
        BOB,
        TestContext,
        pos,
    },
    types::{
        Address,
        Checkpoint,
        GridNumbers,
        PoolState,
    },
};

const B1: u128 = 2_000;
const B2: u128 = 2_000;
const B3: u128 = 2_000;
const B4: u128 = 4_000;

#[tokio::test]
async fn refresh__half_winner_collects_rolled_over_first_quarter() {
    // given
    let ctx = TestContext::native();
    ctx.ledger().settle_quarter(Checkpoint::Q1, Address::ZERO, B1);
    ctx.ledger().settle_quarter(Checkpoint::Half, BOB, B2);
    let mut controller = ctx.controller();

    // when
    let view = controller.refresh().await.unwrap();

    // then
    let settlement = view.settlement;
    assert_eq!(
        settlement.payout(Checkpoint::Q1).outcome,
        PayoutOutcome::RolledOver
    );
    assert_eq!(settlement.payout(Checkpoint::Q1).actual, B1);
    assert_eq!(settlement.payout(Checkpoint::Half).actual, B1 + B2);
    assert_eq!(
        settlement.payout(Checkpoint::Half).outcome,
        PayoutOutcome::Winner(BOB)
    );
    assert_eq!(settlement.total_disbursed(), B1 + B2);
    assert_eq!(settlement.pending_rollover(), 0);
}

#[tokio::test]
async fn refresh__unsettled_later_quarter_leaves_rollover_pending() {
    let ctx = TestContext::native();
    ctx.ledger().settle_quarter(Checkpoint::Q1, Address::ZERO, B1);

    let view = fetch_pool_view(ctx.ledger(), None).await.unwrap();

    assert_eq!(view.settlement.pending_rollover(), B1);
    assert_eq!(
        view.settlement.payout(Checkpoint::Half).outcome,
        PayoutOutcome::Pending
    );
    assert_eq!(view.settlement.total_disbursed(), 0);
}

#[tokio::test]
async fn refresh__final_winner_takes_every_rollover() {
    // given
    let ctx = TestContext::native();
    for (checkpoint, base) in [
        (Checkpoint::Q1, B1),
        (Checkpoint::Half, B2),
        (Checkpoint::Q3, B3),
    ] {
        ctx.ledger().settle_quarter(checkpoint, Address::ZERO, base);
    }
    ctx.ledger().settle_quarter(Checkpoint::Final, ALICE, B4);

    // when
    let view = fetch_pool_view(ctx.ledger(), None).await.unwrap();

    // then
    assert_eq!(
        view.settlement.payout(Checkpoint::Final).actual,
        B1 + B2 + B3 + B4
    );
    assert_eq!(view.settlement.total_disbursed(), B1 + B2 + B3 + B4);
}

#[tokio::test]
async fn refresh__no_winners_splits_everything_across_sold_cells() {
    // given
    let ctx = TestContext::native();
    for index in 0..3 {
        ctx.bob().assign_cell(pos(index), BOB);
    }
    for (checkpoint, base) in Checkpoint::ALL.into_iter().zip([B1, B2, B3, B4]) {
        ctx.ledger().settle_quarter(checkpoint, Address::ZERO, base);
    }

    // when
    let view = fetch_pool_view(ctx.ledger(), None).await.unwrap();

    // then
    let total = B1 + B2 + B3 + B4;
    assert_eq!(view.settlement.equal_distribution(), Some(total));
    assert_eq!(
        view.equal_share(),
        Some(EqualShare {
            per_cell: total / 3,
            remainder: total % 3,
        })
    );
}

#[tokio::test]
async fn winning_cell__maps_score_digits_to_owner() {
    // given
    let ctx = TestContext::native();
    let rows = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
    let cols = [9, 8, 7, 6, 5, 4, 3, 2, 1, 0];
    ctx.ledger()
        .set_grid_numbers(GridNumbers::new(rows, cols).unwrap());
    ctx.ledger().set_pool_state(PoolState::NumbersAssigned);
    ctx.bob().assign_cell(pos(42), BOB);
    ctx.ledger().submit_score(Checkpoint::Q1, 14, 7);

    // when
    let view = fetch_pool_view(ctx.ledger(), None).await.unwrap();

    // then
    assert_eq!(
        view.winning_cell(Checkpoint::Q1),
        Some(WinningCell {
            position: pos(42),
            owner: Some(BOB),
        })
    );
    assert_eq!(view.winning_cell(Checkpoint::Half), None);
}
