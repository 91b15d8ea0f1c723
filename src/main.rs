#[tokio::main]
async fn main() {
    let code = transkribo::app::run().await;
    std::process::exit(code);
}
