use clap::{
    ArgGroup,
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use itertools::Itertools;
use squares::{
    config::{
        AppConfig,
        NetworkEnv,
        Overrides,
        POOLS_ROOT,
        PoolStore,
    },
    controller::{
        AppController,
        ControllerConfig,
        PoolView,
        SnapshotWorkerEvent,
    },
    format::format_with_ticker,
    ledger::{
        HttpLedger,
        InMemoryLedger,
        Ledger,
    },
    orchestrator::Progress,
    settlement::PayoutOutcome,
    types::{
        Address,
        Amount,
        GRID_SIDE,
        PaymentAsset,
        Position,
    },
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::OnceLock,
    time::Duration,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

const SIMULATED_ACCOUNT: Address = Address::new([0xa1; 20]);

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(
    name = "squares",
    about = "Browse a squares pool, reconstruct its payouts and buy cells",
    version,
    group(
        ArgGroup::new("network")
            .args(["local", "testnet", "mainnet"])
    )
)]
struct Args {
    /// Use a gateway on this machine (default)
    #[arg(long)]
    local: bool,

    /// Use the testnet gateway
    #[arg(long)]
    testnet: bool,

    /// Use the mainnet gateway
    #[arg(long)]
    mainnet: bool,

    /// Override the gateway URL for the selected network
    #[arg(long)]
    gateway_url: Option<String>,

    /// Pool address (defaults to the stored pool record)
    #[arg(long)]
    pool: Option<String>,

    /// Account acting on the pool
    #[arg(long)]
    account: Option<String>,

    /// Address granted the token allowance (defaults to the pool)
    #[arg(long)]
    spender: Option<String>,

    /// Ticker shown next to amounts
    #[arg(long)]
    ticker: Option<String>,

    /// Run against an in-memory demo pool instead of a gateway
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    #[arg(long, default_value = POOLS_ROOT)]
    pool_dir: PathBuf,

    /// Store the resolved pool settings for this network
    #[arg(long)]
    save: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconstructed payouts per checkpoint
    Payouts,
    /// Owner map of the grid
    Grid,
    /// Buy the given cells
    Buy {
        #[arg(required = true)]
        positions: Vec<Position>,
        /// Hex encoded 32-byte proof elements, in order
        #[arg(long)]
        proof: Vec<String>,
    },
    /// Pick random free cells, optionally buying them
    QuickPick {
        count: u32,
        #[arg(long)]
        buy: bool,
        #[arg(long)]
        proof: Vec<String>,
    },
    /// Poll the pool and print payouts whenever they change
    Watch {
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

impl Args {
    fn network(&self) -> NetworkEnv {
        if self.testnet {
            NetworkEnv::Testnet
        } else if self.mainnet {
            NetworkEnv::Mainnet
        } else {
            NetworkEnv::Local
        }
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            gateway_url: self.gateway_url.clone(),
            pool: self.pool.clone(),
            account: self.account.clone(),
            spender: self.spender.clone(),
            ticker: self.ticker.clone(),
        }
    }
}

fn init_tracing(log_dir: &Path) {
    let appender = rolling::daily(log_dir, "squares.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(&args.log_dir);
    tracing::info!(network = %args.network(), simulate = args.simulate, "starting squares client");

    if args.simulate {
        let account = match &args.account {
            Some(raw) => raw.parse().wrap_err("Invalid --account")?,
            None => SIMULATED_ACCOUNT,
        };
        let ledger = InMemoryLedger::demo(account, PaymentAsset::Native);
        let config = ControllerConfig {
            poll_interval: Duration::from_millis(50),
            ..ControllerConfig::default()
        };
        let controller = AppController::new(ledger, config);
        return run_command(controller, args.command, args.ticker).await;
    }

    let network = args.network();
    let store = PoolStore::new(&args.pool_dir, network).map_err(|e| eyre!(e))?;
    let record = store.load().map_err(|e| eyre!(e))?;
    let config =
        AppConfig::resolve(network, args.overrides(), record.as_ref()).map_err(|e| eyre!(e))?;
    if args.save {
        store.save(&config.to_record()).map_err(|e| eyre!(e))?;
        println!("Saved pool record to {}", store.path().display());
    }

    let ledger = HttpLedger::new(&config.gateway_url, config.pool, config.account)
        .wrap_err("Failed to build gateway client")?;
    let controller = AppController::new(ledger, ControllerConfig::from(&config));
    run_command(controller, args.command, config.ticker.clone()).await
}

async fn run_command<L>(
    mut controller: AppController<L>,
    command: Command,
    ticker: Option<String>,
) -> Result<()>
where
    L: Ledger + Clone + Send + Sync + 'static,
{
    controller.refresh().await.wrap_err("Failed to load pool")?;
    let printer = Printer::new(&controller, ticker);

    match command {
        Command::Payouts => {
            if let Some(view) = controller.view() {
                printer.payouts(view);
            }
        }
        Command::Grid => {
            if let Some(view) = controller.view() {
                printer.grid(view, &controller.account());
            }
        }
        Command::Buy { positions, proof } => {
            let proof = parse_proof(&proof)?;
            for position in positions {
                if !controller.toggle(position)? {
                    println!("Cell {position} is taken or over your limit; skipping");
                }
            }
            purchase(&mut controller, &printer, proof).await?;
        }
        Command::QuickPick { count, buy, proof } => {
            let proof = parse_proof(&proof)?;
            let picked = controller.random_select(count)?;
            if picked == 0 {
                println!("No cells available to pick");
                return Ok(());
            }
            let positions = controller.selection().positions();
            println!(
                "Picked {} cells: {} (cost {})",
                picked,
                positions.iter().join(", "),
                printer.amount(controller.selection_cost().unwrap_or_default()),
            );
            if buy {
                purchase(&mut controller, &printer, proof).await?;
            }
        }
        Command::Watch { interval_secs } => {
            watch(&mut controller, &printer, Duration::from_secs(interval_secs)).await?;
        }
    }
    controller.shutdown();
    Ok(())
}

async fn purchase<L: Ledger>(
    controller: &mut AppController<L>,
    printer: &Printer,
    proof: Option<Vec<[u8; 32]>>,
) -> Result<()> {
    if controller.selection().is_empty() {
        return Err(eyre!("Nothing selected"));
    }
    let cost = controller.selection_cost().unwrap_or_default();
    println!(
        "Buying {} cells for {}",
        controller.selection().len(),
        printer.amount(cost)
    );
    let step = controller.submit(proof).await?;
    println!("Submitted ({step:?}), waiting for confirmation");

    match controller.wait_for_confirmation().await? {
        Progress::Completed(receipt) => {
            println!(
                "Purchased {} cells [{}] for {} in {}",
                receipt.count,
                receipt.positions.iter().join(", "),
                printer.amount(receipt.total_cost),
                receipt.tx
            );
            Ok(())
        }
        Progress::Failed(err) => Err(eyre!(err)),
        Progress::Suppressed(reason) => {
            println!("Allowance approved; purchase paused ({reason:?}). Run the command again.");
            Ok(())
        }
        Progress::Waiting | Progress::Advanced(_) => {
            let pending = controller
                .orchestrator()
                .pending_tx()
                .map(ToString::to_string)
                .unwrap_or_default();
            println!("Still waiting on {pending}; check again later");
            Ok(())
        }
    }
}

async fn watch<L>(
    controller: &mut AppController<L>,
    printer: &Printer,
    poll_interval: Duration,
) -> Result<()>
where
    L: Ledger + Clone + Send + Sync + 'static,
{
    let (worker, mut snapshot_rx) = controller.spawn_worker(poll_interval);

    let mut last_printed = None;
    loop {
        tokio::select! {
            event = snapshot_rx.recv() => {
                match event {
                    Some(SnapshotWorkerEvent::View(view)) => {
                        let key = (view.settlement, view.info.sold_count);
                        if last_printed != Some(key) {
                            printer.payouts(&view);
                            last_printed = Some(key);
                        }
                        controller.apply_view(*view);
                    }
                    Some(SnapshotWorkerEvent::Failed(message)) => {
                        eprintln!("Refresh failed: {message}");
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.shutdown();
                break;
            }
        }
    }
    worker.await.wrap_err("Snapshot worker panicked")?;
    Ok(())
}

fn parse_proof(raw: &[String]) -> Result<Option<Vec<[u8; 32]>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let elements = raw
        .iter()
        .map(|item| {
            let bytes = hex::decode(item.trim_start_matches("0x"))
                .wrap_err_with(|| format!("Invalid proof element '{item}'"))?;
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| eyre!("Proof element '{item}' is not 32 bytes"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(elements))
}

struct Printer {
    decimals: u8,
    ticker: Option<String>,
}

impl Printer {
    fn new<L: Ledger>(controller: &AppController<L>, ticker: Option<String>) -> Self {
        let decimals = controller
            .view()
            .map(|view| view.info.asset.decimals())
            .unwrap_or_default();
        Self { decimals, ticker }
    }

    fn amount(&self, amount: Amount) -> String {
        format_with_ticker(amount, self.decimals, self.ticker.as_deref())
    }

    fn payouts(&self, view: &PoolView) {
        println!(
            "Pool {} ({:?}) pot {} sold {}/100",
            view.info.pool.short(),
            view.info.state,
            self.amount(view.info.total_pot),
            view.info.sold_count
        );
        for payout in view.settlement.payouts() {
            let outcome = match payout.outcome {
                PayoutOutcome::Winner(address) => format!("won by {}", address.short()),
                PayoutOutcome::RolledOver => "rolled over".to_string(),
                PayoutOutcome::Pending => "pending".to_string(),
                PayoutOutcome::EqualDistribution => "split across all cells".to_string(),
            };
            let cell = view
                .winning_cell(payout.checkpoint)
                .map(|cell| format!(" cell {}", cell.position))
                .unwrap_or_default();
            println!(
                "  {:<6} base {:>14} paid {:>14}  {}{}",
                payout.checkpoint,
                self.amount(payout.base_payout),
                self.amount(payout.actual),
                outcome,
                cell
            );
        }
        if view.settlement.pending_rollover() > 0 {
            println!(
                "  carried forward: {}",
                self.amount(view.settlement.pending_rollover())
            );
        }
        if let Some(share) = view.equal_share() {
            println!(
                "  per cell: {} (remainder {})",
                self.amount(share.per_cell),
                self.amount(share.remainder)
            );
        }
        if let Some(numbers) = &view.numbers {
            println!(
                "  rows {} / cols {}",
                numbers.row_digits.iter().join(""),
                numbers.col_digits.iter().join("")
            );
        }
    }

    fn grid(&self, view: &PoolView, account: &Address) {
        println!(
            "Sold {}/100 at {} per cell",
            view.grid.sold_count(),
            self.amount(view.info.unit_price)
        );
        for row in 0..GRID_SIDE {
            let line = (0..GRID_SIDE)
                .filter_map(|col| Position::from_row_col(row, col).ok())
                .map(|position| match view.grid.owner(position) {
                    None => format!("{:>3}", position.value()),
                    Some(owner) if owner == *account => "  *".to_string(),
                    Some(_) => "  #".to_string(),
                })
                .join(" ");
            println!("{line}");
        }
        println!("* yours  # taken  number: free");
    }
}
