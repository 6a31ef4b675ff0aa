//!
//! docbridge server binary
//! -----------------------
//! Command-line entry point. Configuration comes from environment variables;
//! a few CLI flags override them.

use anyhow::Result;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

use docbridge::config::{DeliveryMode, Settings};

fn parse_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].as_str());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("docbridge\n\nUSAGE:\n  docbridge [--port N] [--host ADDR] [--delivery direct|loopback]\n\nOPTIONS:\n  --port N            HTTP port (env: PORT, default 8080)\n  --host ADDR         Bind address (env: HOST, default 0.0.0.0)\n  --delivery MODE     Bridge delivery: direct or loopback (env: DOCBRIDGE_DELIVERY)\n\nSharePoint: SHAREPOINT_TENANT_ID, SHAREPOINT_CLIENT_ID, SHAREPOINT_CLIENT_SECRET,\n            SHAREPOINT_SITE_URL, SHAREPOINT_FOLDER\n");
        return Ok(());
    }

    let (mut settings, warnings) = Settings::from_env_with_warnings();

    // Init logging: RUST_LOG wins, otherwise DEBUG selects the level
    let default_level = if settings.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    for w in &warnings {
        tracing::warn!(target: "startup", "{}", w);
    }

    // CLI arguments override environment
    if let Some(p) = parse_arg(&args, "--port") {
        match p.parse::<u16>() {
            Ok(port) => settings.port = port,
            Err(_) => tracing::warn!(target: "startup", "ignoring invalid --port {:?}", p),
        }
    }
    if let Some(h) = parse_arg(&args, "--host") {
        settings.host = h.to_string();
    }
    if let Some(d) = parse_arg(&args, "--delivery") {
        match DeliveryMode::parse(d) {
            Some(mode) => settings.delivery = mode,
            None => tracing::warn!(target: "startup", "ignoring unknown --delivery {:?}", d),
        }
    }

    if let Err(e) = docbridge::server::run_with_settings(settings).await {
        tracing::error!("Fatal startup error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
