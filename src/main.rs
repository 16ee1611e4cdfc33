#[tokio::main]
async fn main() {
    if let Err(e) = detectbot::run_bot().await {
        eprintln!("detectbot: {e}");
        std::process::exit(1);
    }
}
