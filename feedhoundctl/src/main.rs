use clap::Parser;

#[tokio::main]
async fn main() {
    feedhoundctl::init_tracing();
    let cli = feedhoundctl::Cli::parse();
    if let Err(err) = feedhoundctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
