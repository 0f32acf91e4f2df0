use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use eum_datastore::collections::retrieve_collections;
use eum_datastore::config::resolve_access_key;
use eum_datastore::download::{self, download_files};
use eum_datastore::{find_files_on_store, DataStore, TokenManager};

mod cli;

use cli::Args;

async fn list_collections(store: &DataStore, json: bool) -> Result<()> {
    let collections = retrieve_collections(store).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&collections)?);
        return Ok(());
    }
    for (id, description) in &collections {
        println!("{id}");
        println!("    {}", description.replace('\n', "\n    "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over -q / -v.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = args.resolve_config()?;
    let store = DataStore::new(&config)?;

    if args.list_collections {
        return list_collections(&store, args.json).await;
    }

    // Bad dates and a missing key fail before anything is searched.
    let query = args.search_query(&config)?;
    let access_key = if args.dry_run {
        None
    } else {
        Some(resolve_access_key(args.eum_access_key.clone())?)
    };

    let ids = find_files_on_store(&store, &query, config.progress).await?;
    println!("A total of {} datasets have been found.", ids.len());

    let Some(access_key) = access_key else {
        for task in download::tasks(&store, &ids, &args.out_dir) {
            let task = task?;
            println!("{} -> {}", task.url, task.output.display());
        }
        return Ok(());
    };

    let mut tokens = TokenManager::new(store.clone(), access_key, config.token_lifetime());
    let summary = download_files(&store, &ids, &args.out_dir, &mut tokens, &config).await?;
    println!("{summary}");

    Ok(())
}
