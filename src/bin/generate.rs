//! Writes a synthetic trade CSV to stdout for load testing.
//!
//! A small share of rows is deliberately broken (wrong field count, bad
//! dates) and some reference product ids that do not exist.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use clap::Parser;

use std::io::{self, BufWriter, Write};

const CURRENCIES: [&str; 4] = ["EUR", "USD", "GBP", "JPY"];

#[derive(Parser)]
#[command(name = "generate", about = "Generates a trade CSV on stdout.")]
struct Cli {
    /// Number of trade rows
    #[arg(short, long, default_value_t = 1_000_000)]
    rows: u64,
    /// Product ids are drawn from 1..=products
    #[arg(short, long, default_value_t = 10)]
    products: u64,
    /// Every n-th row is malformed, 0 for none
    #[arg(long, default_value_t = 1_000)]
    broken_every: u64,
}

fn trade(i: u64, products: u64, start: NaiveDate) -> String {
    let date = start + Duration::days((i % 365) as i64);
    // a few ids past the end of the product table
    let product = (i * 7919) % (products + products / 5 + 1) + 1;
    let currency = CURRENCIES[(i % CURRENCIES.len() as u64) as usize];
    let price = (i * 31) % 100_000;

    format!(
        "{},{},{},{}.{:02}",
        date.format("%Y%m%d"),
        product,
        currency,
        price / 100,
        price % 100
    )
}

fn broken(i: u64) -> String {
    match i % 3 {
        0 => format!("20160101,{},EUR", i),
        1 => format!("2016{:02}01,1,EUR,1.00", 13 + i % 87),
        _ => "not,a,trade,row,at all".to_string(),
    }
}

pub fn main() -> Result<()> {
    let cli = Cli::parse();
    let start = NaiveDate::from_ymd_opt(2016, 1, 1).context("invalid start date")?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "date,product_id,currency,price")?;

    for i in 0..cli.rows {
        let line = if cli.broken_every > 0 && i % cli.broken_every == cli.broken_every - 1 {
            broken(i)
        } else {
            trade(i, cli.products, start)
        };
        writeln!(out, "{}", line)?;
    }

    out.flush()?;
    Ok(())
}
