use anyhow::{Context, Result};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Brokerage environment selector: paper (virtual) or live (prod).
/// Chooses base URLs, `tr_id` variants, and the token file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Virtual,
    Prod,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Virtual => "https://openapivts.koreainvestment.com:29443",
            Environment::Prod => "https://openapi.koreainvestment.com:9443",
        }
    }

    pub fn ws_url(&self) -> &'static str {
        match self {
            Environment::Virtual => "ws://ops.koreainvestment.com:31000",
            Environment::Prod => "ws://ops.koreainvestment.com:21000",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Virtual => write!(f, "virtual"),
            Environment::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "virtual" => Ok(Environment::Virtual),
            "prod" => Ok(Environment::Prod),
            _ => anyhow::bail!("Invalid KIS_ENV: {}. Must be 'virtual' or 'prod'", s),
        }
    }
}

/// Brokerage credentials, all required.
#[derive(Debug, Clone)]
pub struct BrokerEnv {
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub environment: Environment,
}

impl BrokerEnv {
    pub fn from_env() -> Result<Self> {
        let app_key = env::var("KIS_APP_KEY").context("KIS_APP_KEY is required")?;
        let app_secret = env::var("KIS_APP_SECRET").context("KIS_APP_SECRET is required")?;
        let account_no = env::var("KIS_ACCOUNT_NO").context("KIS_ACCOUNT_NO is required")?;
        let environment = env::var("KIS_ENV")
            .context("KIS_ENV is required")?
            .parse::<Environment>()?;

        if account_no.len() != 8 || !account_no.bytes().all(|b| b.is_ascii_digit()) {
            anyhow::bail!("KIS_ACCOUNT_NO must be exactly 8 digits");
        }

        Ok(Self {
            app_key,
            app_secret,
            account_no,
            environment,
        })
    }
}

/// Notification bot credentials.
#[derive(Debug, Clone)]
pub struct NotifierEnv {
    pub bot_token: String,
    pub chat_id: String,
}

impl NotifierEnv {
    pub fn from_env() -> Result<Self> {
        let bot_token = env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN is required")?;
        let chat_id = env::var("TELEGRAM_CHAT_ID").context("TELEGRAM_CHAT_ID is required")?;
        Ok(Self { bot_token, chat_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!(Environment::from_str("virtual").unwrap(), Environment::Virtual);
        assert_eq!(Environment::from_str("PROD").unwrap(), Environment::Prod);
        assert!(Environment::from_str("sandbox").is_err());
    }

    #[test]
    fn test_environment_urls_differ() {
        assert_ne!(Environment::Virtual.base_url(), Environment::Prod.base_url());
        assert_ne!(Environment::Virtual.ws_url(), Environment::Prod.ws_url());
    }
}
