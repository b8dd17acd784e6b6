use anyhow::Result;

use eva_markov::app::run;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    run().await
}
