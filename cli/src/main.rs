//! blockindex CLI — rewind indexed blocks and inspect block filters.
//!
//! Usage:
//! ```bash
//! blockindex rewind ./index.db 10
//! blockindex delete ./index.db 10 --chain bitcoin --json
//! blockindex bloom  0x0000…00 0xdeadbeef
//! blockindex info
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use blockindex_core::{BlockRewindOperation, Bloom, RewindConfig, RewindReport};
use blockindex_storage::sqlite::SqliteStorage;
use tracing::debug;

use crate::logging::{init_tracing, LogConfig};

/// Flags accepted by every command.
#[derive(Debug, Default)]
struct Options {
    log: LogConfig,
    rewind: RewindConfig,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> anyhow::Result<Options> {
    let mut opts = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => opts.log.json = true,
            "--log-level" => {
                opts.log.level = iter.next().context("--log-level needs a value")?.clone();
            }
            "--log-component" => {
                let spec = iter.next().context("--log-component needs a value")?;
                opts.log
                    .add_component(spec)
                    .with_context(|| format!("expected <crate>=<level>, got {spec}"))?;
            }
            "--chain" => {
                opts.rewind.chain = iter.next().context("--chain needs a value")?.clone();
            }
            "--keep-block-row" => opts.rewind.remove_block_row = false,
            "--keep-same-block-spends" => opts.rewind.filter_same_block_spends = false,
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            _ => opts.positional.push(arg.clone()),
        }
    }
    Ok(opts)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "rewind" => run(&args[2..], false).await,
        "delete" => run(&args[2..], true).await,
        "bloom" => cmd_bloom(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("blockindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("blockindex {}", env!("CARGO_PKG_VERSION"));
    println!("Block rewind and UTXO recovery for document-store block indexers\n");
    println!("USAGE:");
    println!("    blockindex <COMMAND> [ARGS] [FLAGS]\n");
    println!("COMMANDS:");
    println!("    info                          Show BlockIndex configuration info");
    println!("    rewind <sqlite-path> <block>  Undo a block's indexed data, keep its Block row");
    println!("    delete <sqlite-path> <block>  Rewind a block and remove its Block row");
    println!("    bloom  <filter-hex> <input>   Test whether a block filter may contain <input> (hex)");
    println!("    version                       Print version");
    println!("    help                          Print this help\n");
    println!("FLAGS:");
    println!("    --chain <slug>                Chain name used in log fields (default: bitcoin)");
    println!("    --keep-block-row              delete: leave the Block row in place");
    println!("    --keep-same-block-spends      Restore spends of outputs created in the same block");
    println!("    --log-level <level>           trace | debug | info | warn | error (default: info)");
    println!("    --log-component <crate=level> Per-crate level override, repeatable");
    println!("    --json                        Emit JSON logs to stderr");
}

fn cmd_info() {
    let defaults = RewindConfig::default();
    println!("BlockIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default chain: {}", defaults.chain);
    println!("  Filter same-block spends: {}", defaults.filter_same_block_spends);
    println!("  Remove Block row on delete: {}", defaults.remove_block_row);
    println!(
        "  Block filter: {} bytes, {} bits, 3 bits per entry (Keccak-256)",
        blockindex_core::BLOOM_LENGTH,
        blockindex_core::BLOOM_BITS
    );
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

async fn run(args: &[String], remove_block: bool) -> anyhow::Result<()> {
    let opts = parse_options(args)?;
    init_tracing(&opts.log);

    let [path, block] = opts.positional.as_slice() else {
        bail!("expected <sqlite-path> <block-index>");
    };
    let block_index: u64 = block
        .parse()
        .with_context(|| format!("invalid block index: {block}"))?;

    let store = SqliteStorage::open(path)
        .await
        .with_context(|| format!("opening {path}"))?;
    debug!(path = %path, block_index, "store opened");

    let op = BlockRewindOperation::new(Arc::new(store), opts.rewind);
    let report = if remove_block {
        op.delete_block(block_index).await?
    } else {
        op.rewind_block(block_index).await?
    };
    print_report(&report);
    Ok(())
}

fn print_report(report: &RewindReport) {
    println!("Rewound block {} ({})", report.block_index, report.block_hash);
    println!(
        "  Archived: {} inputs, {} outputs, {} transactions",
        report.archived_inputs, report.archived_outputs, report.archived_transactions
    );
    let d = &report.deleted;
    println!(
        "  Deleted:  {} outputs, {} inputs, {} transactions, {} address rows, {} history rows, {} utxos",
        d.outputs, d.inputs, d.transactions, d.address_computed, d.address_history, d.unspent_outputs
    );
    println!("  Restored: {} utxos", report.restored_utxos);
    if report.block_removed {
        println!("  Block row removed");
    }
}

fn cmd_bloom(args: &[String]) -> anyhow::Result<()> {
    let [filter, input] = args else {
        bail!("expected <filter-hex> <input-hex>");
    };
    let bloom: Bloom = filter.parse()?;
    let input = hex::decode(input.trim_start_matches("0x")).context("input is not valid hex")?;

    if bloom.contains_input(&input) {
        println!("maybe present");
    } else {
        println!("absent");
    }
    Ok(())
}
