mod cli;

#[tokio::main]
async fn main() {
    if let Err(err) = cli::run_from_args().await {
        eprintln!("sget error: {:#}", err);
        std::process::exit(1);
    }
}
