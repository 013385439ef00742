use crate::error::{
    Error,
    Result,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};

/// Monetary amount in the payment asset's smallest unit.
pub type Amount = u128;

pub const GRID_SIDE: u8 = 10;
pub const GRID_SIZE: usize = 100;

/// Decimal count assumed for the chain's native asset.
pub const NATIVE_DECIMALS: u8 = 18;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    /// Empty sentinel reported by the ledger for "no owner" / "no winner".
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Maps the empty sentinel to `None`.
    pub fn non_zero(self) -> Option<Address> {
        (!self.is_zero()).then_some(self)
    }

    pub fn short(&self) -> String {
        let full = self.to_string();
        format!("{}…{}", &full[..6], &full[full.len() - 4..])
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| Error::validation(format!("invalid address '{raw}': {e}")))?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| {
            Error::validation(format!("invalid address '{raw}': expected 20 bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// One of the hundred cells, numbered row-major from the top-left.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Position(u8);

impl Position {
    pub fn new(index: u8) -> Result<Self> {
        if usize::from(index) >= GRID_SIZE {
            return Err(Error::validation(format!(
                "position {index} is outside the 10x10 grid"
            )));
        }
        Ok(Self(index))
    }

    pub fn all() -> impl Iterator<Item = Position> {
        (0..GRID_SIZE as u8).map(Position)
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn from_row_col(row: u8, col: u8) -> Result<Self> {
        if row >= GRID_SIDE || col >= GRID_SIDE {
            return Err(Error::validation(format!(
                "row {row} / column {col} is outside the grid"
            )));
        }
        Ok(Self(row * GRID_SIDE + col))
    }
}

impl TryFrom<u8> for Position {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Position::new(value)
    }
}

impl From<Position> for u8 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let index: u8 = raw
            .trim()
            .parse()
            .map_err(|_| Error::validation(format!("invalid position '{raw}'")))?;
        Position::new(index)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scoring moment at which a winner may be determined.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    Q1,
    Half,
    Q3,
    Final,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 4] = [
        Checkpoint::Q1,
        Checkpoint::Half,
        Checkpoint::Q3,
        Checkpoint::Final,
    ];

    pub fn index(self) -> usize {
        match self {
            Checkpoint::Q1 => 0,
            Checkpoint::Half => 1,
            Checkpoint::Q3 => 2,
            Checkpoint::Final => 3,
        }
    }

    pub fn path_segment(self) -> &'static str {
        match self {
            Checkpoint::Q1 => "q1",
            Checkpoint::Half => "half",
            Checkpoint::Q3 => "q3",
            Checkpoint::Final => "final",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Checkpoint::Q1 => "Q1",
            Checkpoint::Half => "Halftime",
            Checkpoint::Q3 => "Q3",
            Checkpoint::Final => "Final",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Open,
    Closed,
    NumbersAssigned,
    Scored(Checkpoint),
}

impl PoolState {
    pub fn accepts_purchases(self) -> bool {
        matches!(self, PoolState::Open)
    }
}

/// How a pool is paid for. Fungible assets need an allowance grant before the
/// pool can pull funds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentAsset {
    Native,
    Fungible { token: Address, decimals: u8 },
}

impl PaymentAsset {
    /// Interprets a raw asset id where the zero address denotes the native asset.
    pub fn from_asset_id(asset: Address, decimals: u8) -> Self {
        match asset.non_zero() {
            None => PaymentAsset::Native,
            Some(token) => PaymentAsset::Fungible { token, decimals },
        }
    }

    pub fn decimals(&self) -> u8 {
        match self {
            PaymentAsset::Native => NATIVE_DECIMALS,
            PaymentAsset::Fungible { decimals, .. } => *decimals,
        }
    }

    pub fn token(&self) -> Option<&Address> {
        match self {
            PaymentAsset::Native => None,
            PaymentAsset::Fungible { token, .. } => Some(token),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolInfo {
    pub pool: Address,
    pub state: PoolState,
    pub unit_price: Amount,
    pub asset: PaymentAsset,
    pub total_pot: Amount,
    pub sold_count: u32,
    /// Maximum cells a single account may hold; `None` is unlimited.
    pub cells_per_user: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarterRecord {
    pub checkpoint: Checkpoint,
    pub team_a_score: u32,
    pub team_b_score: u32,
    pub submitted: bool,
    pub settled: bool,
}

impl QuarterRecord {
    pub fn pending(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            team_a_score: 0,
            team_b_score: 0,
            submitted: false,
            settled: false,
        }
    }
}

/// Winner and non-cumulative base payout reported for a single checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WinnerRecord {
    pub checkpoint: Checkpoint,
    pub winner: Option<Address>,
    pub base_payout: Amount,
}

impl WinnerRecord {
    pub fn new(checkpoint: Checkpoint, winner: Address, base_payout: Amount) -> Self {
        Self {
            checkpoint,
            winner: winner.non_zero(),
            base_payout,
        }
    }
}

/// Cell ownership for a whole pool. Cells are only ever assigned, never freed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grid {
    owners: [Option<Address>; GRID_SIZE],
}

impl Default for Grid {
    fn default() -> Self {
        Self::empty()
    }
}

impl Grid {
    pub fn empty() -> Self {
        Self {
            owners: [None; GRID_SIZE],
        }
    }

    /// Builds a grid from the ledger's owner-or-empty array.
    pub fn from_owners(owners: &[Address]) -> Result<Self> {
        if owners.len() != GRID_SIZE {
            return Err(Error::validation(format!(
                "grid must have {GRID_SIZE} entries, got {}",
                owners.len()
            )));
        }
        let mut grid = Self::empty();
        for (slot, owner) in grid.owners.iter_mut().zip(owners) {
            *slot = owner.non_zero();
        }
        Ok(grid)
    }

    pub fn owner(&self, position: Position) -> Option<Address> {
        self.owners[position.index()]
    }

    pub fn is_owned(&self, position: Position) -> bool {
        self.owners[position.index()].is_some()
    }

    pub fn unowned(&self) -> Vec<Position> {
        Position::all().filter(|p| !self.is_owned(*p)).collect()
    }

    pub fn sold_count(&self) -> u32 {
        self.owners.iter().filter(|o| o.is_some()).count() as u32
    }

    pub fn owned_by(&self, account: &Address) -> u32 {
        self.owners
            .iter()
            .filter(|o| o.as_ref() == Some(account))
            .count() as u32
    }

    pub fn positions_of(&self, account: &Address) -> Vec<Position> {
        Position::all()
            .filter(|p| self.owner(*p).as_ref() == Some(account))
            .collect()
    }

    /// Assigns an empty cell. Returns `false` if the cell already had an owner.
    pub fn assign(&mut self, position: Position, owner: Address) -> bool {
        let slot = &mut self.owners[position.index()];
        if slot.is_some() || owner.is_zero() {
            return false;
        }
        *slot = Some(owner);
        true
    }
}

/// Digit permutations drawn for the rows (team A) and columns (team B).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridNumbers {
    pub row_digits: [u8; 10],
    pub col_digits: [u8; 10],
}

impl GridNumbers {
    pub fn new(row_digits: [u8; 10], col_digits: [u8; 10]) -> Result<Self> {
        for digits in [&row_digits, &col_digits] {
            let mut seen = [false; 10];
            for d in digits {
                let slot = seen.get_mut(usize::from(*d)).ok_or_else(|| {
                    Error::validation(format!("grid digit {d} is not in 0-9"))
                })?;
                if *slot {
                    return Err(Error::validation(format!("grid digit {d} is repeated")));
                }
                *slot = true;
            }
        }
        Ok(Self {
            row_digits,
            col_digits,
        })
    }

    /// Cell whose row and column digits match the last digit of each score.
    pub fn winning_position(&self, team_a_score: u32, team_b_score: u32) -> Option<Position> {
        let a = (team_a_score % 10) as u8;
        let b = (team_b_score % 10) as u8;
        let row = self.row_digits.iter().position(|d| *d == a)? as u8;
        let col = self.col_digits.iter().position(|d| *d == b)? as u8;
        Position::from_row_col(row, col).ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxHandle(String);

impl TxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical operation a transaction corresponds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Approval,
    Purchase,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed { kind: TxKind },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseOrder {
    pub positions: Vec<Position>,
    pub total_cost: Amount,
    pub proof: Option<Vec<[u8; 32]>>,
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn address__round_trips_through_hex_text() {
        // given
        let raw = "0x00000000000000000000000000000000000000a1";

        // when
        let address: Address = raw.parse().unwrap();

        // then
        assert_eq!(address.to_string(), raw);
        assert!(!address.is_zero());
    }

    #[test]
    fn address__rejects_wrong_length() {
        let result = "0xdeadbeef".parse::<Address>();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn position__rejects_out_of_range_index() {
        assert!(Position::new(99).is_ok());
        assert!(matches!(Position::new(100), Err(Error::Validation(_))));
    }

    #[test]
    fn payment_asset__zero_asset_id_is_native() {
        assert_eq!(
            PaymentAsset::from_asset_id(Address::ZERO, 6),
            PaymentAsset::Native
        );
        let token = Address::new([7u8; 20]);
        assert_eq!(
            PaymentAsset::from_asset_id(token, 6),
            PaymentAsset::Fungible { token, decimals: 6 }
        );
    }

    #[test]
    fn grid__treats_zero_owner_as_empty() {
        // given
        let alice = Address::new([1u8; 20]);
        let mut owners = vec![Address::ZERO; GRID_SIZE];
        owners[3] = alice;

        // when
        let grid = Grid::from_owners(&owners).unwrap();

        // then
        assert_eq!(grid.sold_count(), 1);
        assert_eq!(grid.owner(Position::new(3).unwrap()), Some(alice));
        assert_eq!(grid.owner(Position::new(4).unwrap()), None);
        assert_eq!(grid.unowned().len(), GRID_SIZE - 1);
    }

    #[test]
    fn grid__assign_never_overwrites_an_owner() {
        let alice = Address::new([1u8; 20]);
        let bob = Address::new([2u8; 20]);
        let mut grid = Grid::empty();
        let p = Position::new(42).unwrap();

        assert!(grid.assign(p, alice));
        assert!(!grid.assign(p, bob));
        assert_eq!(grid.owner(p), Some(alice));
    }

    #[test]
    fn grid_numbers__maps_last_digits_to_cell() {
        // given
        let numbers = GridNumbers::new(
            [3, 1, 4, 0, 5, 9, 2, 6, 8, 7],
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
        )
        .unwrap();

        // when
        let cell = numbers.winning_position(14, 7);

        // then
        assert_eq!(cell, Some(Position::from_row_col(2, 7).unwrap()));
    }

    #[test]
    fn grid_numbers__rejects_repeated_digits() {
        let result = GridNumbers::new([0; 10], [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(result.is_err());
    }
}
