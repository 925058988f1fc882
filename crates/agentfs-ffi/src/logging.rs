// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tracing bootstrap for C hosts

use serde::Deserialize;
use std::io;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const COMPONENT: &str = "agentfs";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

static INITIALIZED: OnceLock<()> = OnceLock::new();

pub(crate) fn parse_level(level: &str) -> anyhow::Result<Level> {
    level
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("invalid log level: {level}"))
}

/// Install a stderr subscriber once per process. Later calls, and hosts
/// that already installed their own subscriber, are left alone.
pub(crate) fn init(default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{default_level},agentfs_core={default_level},{COMPONENT}={default_level}"))
    });

    let result = match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stderr).json();
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
            tracing_subscriber::registry().with(filter).with(layer).try_init()
        }
    };
    let _ = INITIALIZED.set(());
    result.map_err(|err| anyhow::anyhow!("failed to install subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert!(parse_level("chatty").is_err());
    }
}
