//! Text rendering for the `routes` and `check` subcommands.

use std::fmt::Write;

use anyhow::Result;
use meshrpc_client::ClientConfig;

/// One line per route: service id, routing path, addresses and flags.
pub fn render_routes(config: &ClientConfig) -> Result<String> {
    let mut out = String::new();
    for route in config.routes()? {
        let addresses: Vec<String> = route.addresses().iter().map(ToString::to_string).collect();
        let mut flags = Vec::new();
        if route.descriptor.metadata.enable_authorization {
            flags.push("auth");
        }
        if route.descriptor.metadata.disable_network {
            flags.push("local");
        }

        write!(
            out,
            "{}\t{}\t{}",
            route.service_id(),
            route.descriptor.routing_path,
            addresses.join(",")
        )?;
        if !flags.is_empty() {
            write!(out, "\t[{}]", flags.join(","))?;
        }
        out.push('\n');
    }
    Ok(out)
}

/// Summary of the effective command of every configured service.
pub fn render_commands(config: &ClientConfig) -> Result<String> {
    let mut out = String::new();
    let mut commands: Vec<_> = config.commands()?.into_iter().collect();
    commands.sort_by(|a, b| a.0.cmp(&b.0));

    let defaults = std::iter::once(("(defaults)".to_string(), config.defaults.clone()));
    for (service_id, command) in defaults.chain(commands) {
        writeln!(
            out,
            "{}\tstrategy={:?} attempts={} timeout={}ms selector={:?} max_concurrent={}",
            service_id,
            command.strategy,
            command.attempts(),
            command.execution_timeout_ms,
            command.shunt_strategy,
            command.max_concurrent_requests,
        )?;
    }
    Ok(out)
}
