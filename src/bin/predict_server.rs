#[tokio::main]
async fn main() {
    if let Err(e) = detectbot::run_predict_server().await {
        eprintln!("predict-server: {e}");
        std::process::exit(1);
    }
}
