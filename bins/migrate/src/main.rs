#![forbid(unsafe_code)]

/// Applies the file and download schema to `DATABASE_URL`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    codedrop_storage::migrate().await?;
    println!("codedrop schema is up to date");
    Ok(())
}
