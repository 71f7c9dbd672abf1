use anyhow::Context;
use redis::Client;

/// Opens the event bus client and checks the server answers.
pub async fn create_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url).context("invalid REDIS_URL")?;
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("Redis did not answer PING")?;
    Ok(client)
}
