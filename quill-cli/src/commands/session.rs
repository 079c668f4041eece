//! Session command handler

use anyhow::Result;
use colored::*;

use crate::api::ApiClient;
use crate::config::Config;

pub async fn show_session(config: &Config) -> Result<()> {
    let client = ApiClient::new(&config.api_url);
    let stats = client.session_stats().await?;

    println!("{}", "Provider Session:".bold());
    println!("  Requests:      {}", stats.requests_this_session);
    match stats.session_reset_time {
        Some(reset) => println!("  Window resets: {}", reset.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Window resets: {}", "unknown".dimmed()),
    }

    if stats.is_rate_limited {
        let until = stats
            .rate_limited_until
            .map(|until| until.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("  Dispatch:      {} until {}", "suspended".red(), until);
    } else {
        println!("  Dispatch:      {}", "open".green());
    }

    Ok(())
}
