use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zk_relay_core::{
    chain_adapter::boc,
    codec,
    config::Format,
    price::{Asset, CoinGeckoOracle, PriceOracle},
    relayer::{
        direction::{EvmToTon, TonToEvm},
        Relayer,
    },
    store::{CursorStore, IdempotencyStore, SledStore},
    Config,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 日志详细程度 (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继器服务
    Start {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 查看游标和已处理的 nonce
    Status {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 解码一条十六进制桥消息（平铺消息或 BOC）
    Decode {
        #[arg(value_name = "HEX")]
        payload: String,
    },
    /// 按当前价格换算金额（仅供展示）
    Quote {
        #[arg(long)]
        amount: f64,
        #[arg(long, default_value = "ton")]
        from: String,
        #[arg(long, default_value = "ethereum")]
        to: String,
        #[arg(long, default_value = "https://api.coingecko.com/api/v3")]
        api_url: String,
    },
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "nonce")]
    key: String,
    status: String,
    attempts: u32,
    #[tabled(rename = "tx")]
    tx_id: String,
    #[tabled(rename = "last error")]
    last_error: String,
}

fn setup_logger(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("zk_relay_core={},zk_relay={}", level, level)))?;
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .init();
    Ok(())
}

/// Reads the file without validating it; `status` must work without signer
/// secrets in the environment.
fn read_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    Ok(Config::parse(&raw, Format::from_path(path))?)
}

fn status(config: &Config) -> Result<()> {
    let store = SledStore::open(&config.store.path)
        .with_context(|| format!("Failed to open store {}", config.store.path.display()))?;
    println!("游标:");
    for direction in [EvmToTon::NAME, TonToEvm::NAME] {
        match store.load_cursor(direction)? {
            Some(cursor) => println!("  - {}: {}", direction, cursor),
            None => println!("  - {}: (none)", direction),
        }
    }

    let mut records = store.records()?;
    records.sort_by_key(|r| (r.key.source_chain_id, r.key.opcode, r.key.nonce));
    let rows: Vec<RecordRow> = records
        .into_iter()
        .map(|r| RecordRow {
            key: r.key.to_string(),
            status: r.status.to_string(),
            attempts: r.attempt_count,
            tx_id: r.tx_id.map(|t| t.to_string()).unwrap_or_default(),
            last_error: r.last_error.unwrap_or_default(),
        })
        .collect();
    println!("已处理记录: {}", rows.len());
    if !rows.is_empty() {
        println!("{}", Table::new(rows).with(Style::modern()));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    setup_logger(cli.verbose)?;

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("正在验证配置文件: {:?}", config);
            let config = Config::load(config)?;
            println!("配置文件验证成功!");
            println!("配置内容概要:");
            println!("- 方向: {}", config.directions.join(", "));
            println!("- TON: chain {} bridge {}", config.ton.chain_id, config.ton_bridge()?.to_friendly(true, false));
            println!("- EVM: chain {} bridge {}", config.evm.chain_id, config.evm_bridge()?);
            println!("- 中继器配置:");
            println!("  - 轮询间隔: {}秒", config.relayer.poll_interval);
            println!("  - 每页交易数: {}", config.relayer.page_size);
            println!("  - 最大证明次数: {}", config.relayer.max_proof_attempts);
            println!("  - 最大提交次数: {}", config.relayer.max_submit_attempts);
            println!("- 存储: {}", config.store.path.display());
            Ok(())
        }
        Commands::Start { config } => {
            info!("使用配置文件: {:?}", config);

            // 加载配置
            let config = Config::load(config)?;

            let relayer = Relayer::new(config)?;
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("收到退出信号，等待当前事件处理完成...");
                    shutdown.cancel();
                }
            });

            info!("中继器初始化成功，开始运行...");
            if let Err(e) = relayer.start(cancel).await {
                error!("中继器服务异常退出: {}", e);
                return Err(e.into());
            }
            Ok(())
        }
        Commands::Status { config } => status(&read_config(&config)?),
        Commands::Decode { payload } => {
            let bytes = hex::decode(payload.trim().trim_start_matches("0x")).context("payload is not hex")?;
            let (event, proof) = if boc::is_boc(&bytes) {
                codec::decode_cell(&boc::parse(&bytes)?)?
            } else {
                codec::decode_with_proof(&bytes)?
            };
            println!("{}", serde_json::to_string_pretty(&event)?);
            if let Some(proof) = proof {
                println!("{}", serde_json::to_string_pretty(&proof)?);
            }
            Ok(())
        }
        Commands::Quote {
            amount,
            from,
            to,
            api_url,
        } => {
            let (from, to): (Asset, Asset) = (from.parse()?, to.parse()?);
            let oracle = CoinGeckoOracle::new(&api_url);
            let converted = oracle.convert(amount, from, to).await?;
            println!("{} {} ≈ {} {}", amount, from, converted, to);
            Ok(())
        }
    }
}
