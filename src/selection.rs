use crate::{
    error::{
        Error,
        Result,
    },
    types::{
        Amount,
        Grid,
        Position,
    },
};
use rand::{
    Rng,
    seq::SliceRandom,
};
use std::collections::BTreeSet;

/// How many more cells the current account may still buy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quota {
    Unlimited,
    Remaining(u32),
}

impl Quota {
    pub fn for_account(cells_per_user: Option<u32>, already_owned: u32) -> Self {
        match cells_per_user {
            None => Quota::Unlimited,
            Some(limit) => Quota::Remaining(limit.saturating_sub(already_owned)),
        }
    }

    fn admits(self, size: usize) -> bool {
        match self {
            Quota::Unlimited => true,
            Quota::Remaining(remaining) => size < remaining as usize,
        }
    }

    fn cap(self, wanted: usize) -> usize {
        match self {
            Quota::Unlimited => wanted,
            Quota::Remaining(remaining) => wanted.min(remaining as usize),
        }
    }
}

/// Cells the user intends to buy this session. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    positions: BTreeSet<Position>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, position: Position) -> bool {
        self.positions.contains(&position)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.iter().copied().collect()
    }

    /// Removes the position if selected, otherwise adds it when it is unowned
    /// and the quota leaves room. Returns whether the selection changed.
    pub fn toggle(&mut self, position: Position, grid: &Grid, quota: Quota) -> bool {
        if self.positions.remove(&position) {
            return true;
        }
        if grid.is_owned(position) || !quota.admits(self.positions.len()) {
            return false;
        }
        self.positions.insert(position)
    }

    /// Replaces the selection with up to `count` uniformly drawn unowned cells.
    /// Returns how many were picked; zero leaves the selection untouched.
    pub fn random_select<R: Rng + ?Sized>(
        &mut self,
        count: u32,
        grid: &Grid,
        quota: Quota,
        rng: &mut R,
    ) -> Result<usize> {
        if count == 0 {
            return Err(Error::validation("quick-pick count must be positive"));
        }
        let mut available = grid.unowned();
        let cap = quota.cap(count as usize).min(available.len());
        if cap == 0 {
            return Ok(0);
        }
        let (picked, _) = available.partial_shuffle(rng, cap);
        self.positions = picked.iter().copied().collect();
        Ok(cap)
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }

    pub fn cost(&self, unit_price: Amount) -> Result<Amount> {
        unit_price
            .checked_mul(self.positions.len() as Amount)
            .ok_or_else(|| Error::validation("selection cost overflows"))
    }

    /// Drops cells that became owned and trims to the quota, highest positions
    /// first. Returns what was dropped.
    pub fn revalidate(&mut self, grid: &Grid, quota: Quota) -> Vec<Position> {
        let mut dropped: Vec<Position> = self
            .positions
            .iter()
            .copied()
            .filter(|p| grid.is_owned(*p))
            .collect();
        for position in &dropped {
            self.positions.remove(position);
        }
        let allowed = quota.cap(self.positions.len());
        while self.positions.len() > allowed {
            if let Some(last) = self.positions.pop_last() {
                dropped.push(last);
            }
        }
        dropped.sort();
        dropped
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::types::Address;
    use proptest::prelude::*;
    use rand::{
        SeedableRng,
        rngs::StdRng,
    };
    use std::collections::HashSet;

    const ALICE: Address = Address::new([0xa1; 20]);

    fn pos(index: u8) -> Position {
        Position::new(index).unwrap()
    }

    fn grid_with_owned(owned: &[u8]) -> Grid {
        let mut grid = Grid::empty();
        for index in owned {
            grid.assign(pos(*index), ALICE);
        }
        grid
    }

    #[test]
    fn toggle__adds_then_removes_a_position() {
        // given
        let grid = Grid::empty();
        let mut selection = Selection::new();

        // when
        let added = selection.toggle(pos(7), &grid, Quota::Unlimited);
        let removed = selection.toggle(pos(7), &grid, Quota::Unlimited);

        // then
        assert!(added);
        assert!(removed);
        assert!(selection.is_empty());
    }

    #[test]
    fn toggle__ignores_owned_positions() {
        let grid = grid_with_owned(&[12]);
        let mut selection = Selection::new();

        let changed = selection.toggle(pos(12), &grid, Quota::Unlimited);

        assert!(!changed);
        assert!(selection.is_empty());
    }

    #[test]
    fn toggle__is_a_no_op_once_quota_is_reached() {
        // given
        let grid = Grid::empty();
        let quota = Quota::Remaining(2);
        let mut selection = Selection::new();
        selection.toggle(pos(1), &grid, quota);
        selection.toggle(pos(2), &grid, quota);

        // when
        let changed = selection.toggle(pos(3), &grid, quota);

        // then
        assert!(!changed);
        assert_eq!(selection.positions(), vec![pos(1), pos(2)]);
    }

    #[test]
    fn toggle__can_still_remove_when_quota_is_exhausted() {
        let grid = Grid::empty();
        let mut selection = Selection::new();
        selection.toggle(pos(1), &grid, Quota::Remaining(1));

        let changed = selection.toggle(pos(1), &grid, Quota::Remaining(0));

        assert!(changed);
        assert!(selection.is_empty());
    }

    #[test]
    fn random_select__replaces_previous_selection() {
        // given
        let grid = Grid::empty();
        let mut rng = StdRng::seed_from_u64(7);
        let mut selection = Selection::new();
        selection.random_select(5, &grid, Quota::Unlimited, &mut rng).unwrap();

        // when
        let picked = selection
            .random_select(3, &grid, Quota::Unlimited, &mut rng)
            .unwrap();

        // then
        assert_eq!(picked, 3);
        assert_eq!(selection.len(), 3);
    }

    #[test]
    fn random_select__caps_at_quota_and_availability() {
        let owned: Vec<u8> = (0..95).collect();
        let grid = grid_with_owned(&owned);
        let mut rng = StdRng::seed_from_u64(1);
        let mut selection = Selection::new();

        let by_availability = selection
            .random_select(10, &grid, Quota::Unlimited, &mut rng)
            .unwrap();
        assert_eq!(by_availability, 5);

        let by_quota = selection
            .random_select(10, &grid, Quota::Remaining(2), &mut rng)
            .unwrap();
        assert_eq!(by_quota, 2);
    }

    #[test]
    fn random_select__leaves_selection_alone_when_nothing_can_be_picked() {
        // given
        let grid = Grid::empty();
        let mut rng = StdRng::seed_from_u64(3);
        let mut selection = Selection::new();
        selection.toggle(pos(4), &grid, Quota::Unlimited);

        // when
        let picked = selection
            .random_select(4, &grid, Quota::Remaining(0), &mut rng)
            .unwrap();

        // then
        assert_eq!(picked, 0);
        assert_eq!(selection.positions(), vec![pos(4)]);
    }

    #[test]
    fn random_select__rejects_zero_count() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut selection = Selection::new();

        let result = selection.random_select(0, &Grid::empty(), Quota::Unlimited, &mut rng);

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn random_select__reaches_every_available_cell() {
        let grid = grid_with_owned(&[0, 1, 2]);
        let mut rng = StdRng::seed_from_u64(99);
        let mut selection = Selection::new();
        let mut seen = HashSet::new();

        for _ in 0..400 {
            selection
                .random_select(5, &grid, Quota::Unlimited, &mut rng)
                .unwrap();
            seen.extend(selection.positions());
        }

        assert_eq!(seen.len(), 97);
        assert!(!seen.contains(&pos(0)));
    }

    #[test]
    fn cost__multiplies_unit_price_by_size() {
        // given
        let grid = Grid::empty();
        let mut selection = Selection::new();
        for index in [3, 47, 99] {
            selection.toggle(pos(index), &grid, Quota::Unlimited);
        }

        // when
        let cost = selection.cost(100).unwrap();

        // then
        assert_eq!(cost, 300);
    }

    #[test]
    fn cost__reports_overflow() {
        let grid = Grid::empty();
        let mut selection = Selection::new();
        selection.toggle(pos(1), &grid, Quota::Unlimited);
        selection.toggle(pos(2), &grid, Quota::Unlimited);

        assert!(selection.cost(Amount::MAX).is_err());
    }

    #[test]
    fn revalidate__drops_newly_owned_and_excess_positions() {
        // given
        let mut selection = Selection::new();
        for index in [5, 10, 20, 30] {
            selection.toggle(pos(index), &Grid::empty(), Quota::Unlimited);
        }
        let grid = grid_with_owned(&[10]);

        // when
        let dropped = selection.revalidate(&grid, Quota::Remaining(2));

        // then
        assert_eq!(dropped, vec![pos(10), pos(30)]);
        assert_eq!(selection.positions(), vec![pos(5), pos(20)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
        #[test]
        fn random_select__returns_distinct_unowned_cells(
            owned in proptest::collection::btree_set(0u8..100, 0..60),
            count in 1u32..120,
            seed in any::<u64>(),
        ) {
            let owned: Vec<u8> = owned.into_iter().collect();
            let grid = grid_with_owned(&owned);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut selection = Selection::new();

            let picked = selection
                .random_select(count, &grid, Quota::Unlimited, &mut rng)
                .unwrap();

            let expected = (count as usize).min(100 - owned.len());
            prop_assert_eq!(picked, expected);
            prop_assert_eq!(selection.len(), expected);
            prop_assert!(selection.positions().iter().all(|p| !grid.is_owned(*p)));
        }

        #[test]
        fn toggle__never_exceeds_remaining_quota(
            remaining in 0u32..10,
            toggles in proptest::collection::vec(0u8..100, 0..50),
        ) {
            let grid = Grid::empty();
            let quota = Quota::Remaining(remaining);
            let mut selection = Selection::new();

            for index in toggles {
                selection.toggle(pos(index), &grid, quota);
                prop_assert!(selection.len() <= remaining as usize);
            }
        }
    }
}
