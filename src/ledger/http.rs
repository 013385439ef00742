use std::fmt;

use reqwest::{
    Response,
    StatusCode,
};
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};

use super::{
    LedgerError,
    LedgerRead,
    LedgerResult,
    LedgerWrite,
    TxTracker,
};
use crate::types::{
    Address,
    Amount,
    Checkpoint,
    Grid,
    GridNumbers,
    NATIVE_DECIMALS,
    PaymentAsset,
    PoolInfo,
    PoolState,
    PurchaseOrder,
    QuarterRecord,
    TxHandle,
    TxKind,
    TxStatus,
    WinnerRecord,
};

/// Ledger gateway speaking JSON over HTTP. Reads are served by the gateway's
/// contract view endpoints; writes are forwarded to the signer bound to
/// `account`.
#[derive(Clone)]
pub struct HttpLedger {
    base_url: String,
    pool: Address,
    account: Address,
    http: reqwest::Client,
}

impl HttpLedger {
    pub fn new(
        base_url: impl Into<String>,
        pool: Address,
        account: Address,
    ) -> LedgerResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| transport("failed to build HTTP client for ledger gateway", e))?;
        Ok(Self {
            base_url,
            pool,
            account,
            http,
        })
    }

    pub fn pool(&self) -> Address {
        self.pool
    }

    fn pool_url(&self, path: &str) -> String {
        format!("{}/pools/{}/{}", self.base_url, self.pool, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> LedgerResult<T> {
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| transport("ledger request failed", e))?;
        read_json(res, &url).await
    }

    async fn post_tx<B: Serialize>(&self, url: String, body: &B) -> LedgerResult<TxHandle> {
        let res = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport("ledger request failed", e))?;
        let status = res.status();
        if status.is_success() {
            let dto: SubmittedDto = read_json(res, &url).await?;
            return Ok(TxHandle::new(dto.tx));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| transport("failed to read ledger response body", e))?;
        Err(write_error(status, &bytes))
    }
}

async fn read_json<T: DeserializeOwned>(res: Response, url: &str) -> LedgerResult<T> {
    let status = res.status();
    let bytes = res
        .bytes()
        .await
        .map_err(|e| transport("failed to read ledger response body", e))?;
    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes);
        return Err(LedgerError::Transport(format!(
            "ledger gateway responded with {status} for {url}: {body}"
        )));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| transport(&format!("invalid ledger payload from {url}"), e))
}

fn write_error(status: StatusCode, bytes: &[u8]) -> LedgerError {
    let dto: ErrorDto = serde_json::from_slice(bytes).unwrap_or_default();
    let message = dto
        .message
        .clone()
        .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned());
    let code = dto.code.as_deref();
    if status == StatusCode::FORBIDDEN || code == Some("rejected") {
        return LedgerError::Rejected(message);
    }
    if code == Some("insufficient_allowance") {
        return LedgerError::InsufficientAllowance {
            required: parse_amount_or_zero(dto.required.as_deref()),
            available: parse_amount_or_zero(dto.available.as_deref()),
        };
    }
    if status == StatusCode::CONFLICT
        || status == StatusCode::UNPROCESSABLE_ENTITY
        || code == Some("reverted")
    {
        return LedgerError::Reverted(message);
    }
    LedgerError::Transport(format!("ledger gateway responded with {status}: {message}"))
}

fn transport(context: &str, err: impl fmt::Display) -> LedgerError {
    LedgerError::Transport(format!("{context}: {err}"))
}

fn parse_amount(raw: &str) -> LedgerResult<Amount> {
    raw.trim()
        .parse()
        .map_err(|_| LedgerError::Transport(format!("invalid amount '{raw}' from ledger")))
}

fn parse_amount_or_zero(raw: Option<&str>) -> Amount {
    raw.and_then(|r| parse_amount(r).ok()).unwrap_or_default()
}

fn parse_address(raw: &str) -> LedgerResult<Address> {
    raw.parse()
        .map_err(|e| LedgerError::Transport(format!("invalid address from ledger: {e}")))
}

impl LedgerRead for HttpLedger {
    fn account(&self) -> Address {
        self.account
    }

    async fn pool_info(&self) -> LedgerResult<PoolInfo> {
        let dto: PoolInfoDto = self.get_json(self.pool_url("info")).await?;
        dto.into_pool_info(self.pool)
    }

    async fn grid(&self) -> LedgerResult<Grid> {
        let dto: GridDto = self.get_json(self.pool_url("grid")).await?;
        let owners = dto
            .owners
            .iter()
            .map(|raw| parse_address(raw))
            .collect::<LedgerResult<Vec<_>>>()?;
        Grid::from_owners(&owners).map_err(|e| LedgerError::Transport(e.to_string()))
    }

    async fn quarter_score(&self, checkpoint: Checkpoint) -> LedgerResult<QuarterRecord> {
        let url = self.pool_url(&format!("quarters/{}", checkpoint.path_segment()));
        let dto: QuarterDto = self.get_json(url).await?;
        Ok(QuarterRecord {
            checkpoint,
            team_a_score: dto.team_a_score,
            team_b_score: dto.team_b_score,
            submitted: dto.submitted,
            settled: dto.settled,
        })
    }

    async fn quarter_winner(&self, checkpoint: Checkpoint) -> LedgerResult<WinnerRecord> {
        let url = self.pool_url(&format!("quarters/{}/winner", checkpoint.path_segment()));
        let dto: WinnerDto = self.get_json(url).await?;
        Ok(WinnerRecord::new(
            checkpoint,
            parse_address(&dto.winner)?,
            parse_amount(&dto.base_payout)?,
        ))
    }

    async fn allowance(&self, token: &Address, spender: &Address) -> LedgerResult<Amount> {
        let url = format!(
            "{}/tokens/{}/allowance?owner={}&spender={}",
            self.base_url, token, self.account, spender
        );
        let dto: AllowanceDto = self.get_json(url).await?;
        parse_amount(&dto.amount)
    }

    async fn grid_numbers(&self) -> LedgerResult<Option<GridNumbers>> {
        let url = self.pool_url("numbers");
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| transport("ledger request failed", e))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let dto: NumbersDto = read_json(res, &url).await?;
        GridNumbers::new(dto.rows, dto.cols)
            .map(Some)
            .map_err(|e| LedgerError::Transport(e.to_string()))
    }
}

impl LedgerWrite for HttpLedger {
    async fn purchase(&self, order: &PurchaseOrder) -> LedgerResult<TxHandle> {
        let body = PurchaseDto {
            account: self.account.to_string(),
            positions: order.positions.iter().map(|p| p.value()).collect(),
            total_cost: order.total_cost.to_string(),
            proof: order
                .proof
                .as_ref()
                .map(|nodes| nodes.iter().map(|n| format!("0x{}", hex::encode(n))).collect()),
        };
        self.post_tx(self.pool_url("purchase"), &body).await
    }

    async fn approve(
        &self,
        token: &Address,
        spender: &Address,
        amount: Amount,
    ) -> LedgerResult<TxHandle> {
        let url = format!("{}/tokens/{}/approve", self.base_url, token);
        let body = ApproveDto {
            account: self.account.to_string(),
            spender: spender.to_string(),
            amount: amount.to_string(),
        };
        self.post_tx(url, &body).await
    }
}

impl TxTracker for HttpLedger {
    async fn status(&self, handle: &TxHandle) -> LedgerResult<TxStatus> {
        let url = format!("{}/tx/{}", self.base_url, handle);
        let dto: TxStatusDto = self.get_json(url).await?;
        Ok(match dto.status {
            TxStateDto::Pending => TxStatus::Pending,
            TxStateDto::Confirmed => TxStatus::Confirmed { kind: dto.kind },
            TxStateDto::Failed => TxStatus::Failed {
                reason: dto.message.unwrap_or_else(|| "transaction failed".to_string()),
            },
        })
    }
}

impl fmt::Display for HttpLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pool {})", self.base_url, self.pool)
    }
}

#[derive(Deserialize)]
struct PoolInfoDto {
    state: PoolState,
    unit_price: String,
    asset_id: String,
    #[serde(default)]
    asset_decimals: Option<u8>,
    total_pot: String,
    sold_count: u32,
    #[serde(default)]
    cells_per_user: Option<u32>,
}

impl PoolInfoDto {
    fn into_pool_info(self, pool: Address) -> LedgerResult<PoolInfo> {
        let asset_id = parse_address(&self.asset_id)?;
        if !asset_id.is_zero() && self.asset_decimals.is_none() {
            return Err(LedgerError::Transport(format!(
                "ledger did not report decimals for payment token {asset_id}"
            )));
        }
        let asset = PaymentAsset::from_asset_id(
            asset_id,
            self.asset_decimals.unwrap_or(NATIVE_DECIMALS),
        );
        Ok(PoolInfo {
            pool,
            state: self.state,
            unit_price: parse_amount(&self.unit_price)?,
            asset,
            total_pot: parse_amount(&self.total_pot)?,
            sold_count: self.sold_count,
            cells_per_user: self.cells_per_user,
        })
    }
}

#[derive(Deserialize)]
struct GridDto {
    owners: Vec<String>,
}

#[derive(Deserialize)]
struct QuarterDto {
    team_a_score: u32,
    team_b_score: u32,
    submitted: bool,
    settled: bool,
}

#[derive(Deserialize)]
struct WinnerDto {
    winner: String,
    base_payout: String,
}

#[derive(Deserialize)]
struct AllowanceDto {
    amount: String,
}

#[derive(Deserialize)]
struct NumbersDto {
    rows: [u8; 10],
    cols: [u8; 10],
}

#[derive(Serialize)]
struct PurchaseDto {
    account: String,
    positions: Vec<u8>,
    total_cost: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proof: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ApproveDto {
    account: String,
    spender: String,
    amount: String,
}

#[derive(Deserialize)]
struct SubmittedDto {
    tx: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum TxStateDto {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Deserialize)]
struct TxStatusDto {
    status: TxStateDto,
    kind: TxKind,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorDto {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    required: Option<String>,
    #[serde(default)]
    available: Option<String>,
}
