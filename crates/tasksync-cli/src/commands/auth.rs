use chrono::{DateTime, Utc};
use clap::Subcommand;
use tasksync_core::auth::KeyringTokenProvider;
use tasksync_core::Config;

use super::CliResult;

#[derive(Subcommand)]
pub enum AuthAction {
    /// Show which credentials sync will use
    Status,
    /// Remove stored tokens from the keyring
    Logout,
}

pub fn run(action: AuthAction) -> CliResult {
    let config = Config::load()?;
    let provider = KeyringTokenProvider::new(config.auth.clone());

    match action {
        AuthAction::Status => {
            if std::env::var("TASKSYNC_ACCESS_TOKEN").is_ok_and(|t| !t.trim().is_empty()) {
                println!("Using access token from TASKSYNC_ACCESS_TOKEN");
                return Ok(());
            }
            match provider.tokens()? {
                Some(tokens) => {
                    let now = Utc::now().timestamp();
                    let expiry = tokens
                        .expires_at
                        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_else(|| "never".into());
                    let state = if !tokens.is_expired(now) {
                        "valid"
                    } else if tokens.refresh_token.is_some() {
                        "expired, will refresh"
                    } else {
                        "expired"
                    };
                    println!("{}: {state} (expires {expiry})", provider.service_name());
                }
                None => println!("{}: not authenticated", provider.service_name()),
            }
        }
        AuthAction::Logout => {
            provider.logout()?;
            println!("{}: tokens removed", provider.service_name());
        }
    }
    Ok(())
}
