mod config;
mod error;
mod handler;
mod resize;
mod retry;
mod store;
mod validation;

use lambda_runtime::service_fn;
use tracing_subscriber::EnvFilter;

type Result<T> = anyhow::Result<T, lambda_runtime::Error>;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // CloudWatch stamps every line, and JSON keeps span fields queryable.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(false)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = aws_config::load_from_env().await;
    let s3client = aws_sdk_s3::Client::new(&config);
    let s3client = &s3client;

    lambda_runtime::run(service_fn(move |event| async move {
        handler::function_handler(event, s3client).await
    }))
    .await
}
