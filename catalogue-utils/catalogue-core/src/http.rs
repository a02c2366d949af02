use std::time::Duration;

use reqwest::blocking::Client;

use crate::config::USER_AGENT;

/// Blocking client shared by all workers of a run. `Client` is reference
/// counted, so clones share one connection pool.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}
