//! Full-text message search over a snapshot store (spec §4.A.4).

use std::path::PathBuf;

use archive_store::Store;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "search", about = "Full-text searches archived messages")]
struct Args {
    #[arg(long)]
    store: PathBuf,

    query: String,

    #[arg(long, default_value_t = 20)]
    limit: i64,

    #[arg(long, default_value_t = 0)]
    offset: i64,

    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    archive_cli::init_logging(&args.log);

    let store = Store::open(&args.store)?;
    let query = args.query.clone();
    let hits = store
        .with_conn(move |conn| archive_store::search_messages(conn, &query, "**", "**", args.limit, args.offset))
        .await?;

    for hit in &hits {
        println!("[{}/{}] {}: {}", hit.guild_name, hit.channel_name, hit.author_name, hit.highlighted_content);
    }
    if hits.is_empty() {
        println!("no results");
    }
    Ok(())
}
