use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = runwatch::cli::Cli::parse();
    let is_json = args.json;

    match runwatch::cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_json {
                // keep stdout machine-readable
                println!("{}", serde_json::json!({ "kind": "error", "message": format!("{e:#}") }));
                std::process::exit(1);
            }
            Err(e)
        }
    }
}
