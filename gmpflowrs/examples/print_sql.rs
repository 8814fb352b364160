use std::env;

use gmpflow::dialect::SnowflakeDialect;
use gmpflow::{QueryBuilder, QueryParams, TemplateCatalog};

fn usage() {
    eprintln!("Usage: print_sql <panel> <start_date> <end_date> [bucket]");
    eprintln!("Example: cargo run --example print_sql -- time_series 2023-01-01 2023-03-31 week");
}

fn main() -> anyhow::Result<()> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 3 {
        usage();
        std::process::exit(1);
    }

    let catalog = TemplateCatalog::builtin()?;
    let template = catalog.get(&args[0])?;
    let params = QueryParams::new()
        .with("start_date", args[1].as_str())
        .with("end_date", args[2].as_str())
        .with("bucket", args.get(3).map_or("day", String::as_str));

    let sql = QueryBuilder::new().build(template, &params, &SnowflakeDialect)?;
    println!("{sql}");
    Ok(())
}
