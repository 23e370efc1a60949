use reelsmith::cli;

#[tokio::main]
async fn main() {
    let code = cli::main().await;
    std::process::exit(code);
}
