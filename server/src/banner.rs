//! Startup banner.

use std::fmt::Write;

use io_net::{Endpoint, ProcessId};
use protocol_tcp_rpc::CryptoSchema;

use crate::config::TargetConfig;

pub struct BannerConfig<'a> {
    pub version: &'a str,
    pub identity: &'a ProcessId,
    pub listeners: &'a [Endpoint],
    pub targets: &'a [TargetConfig],
    pub crypto: CryptoSchema,
    pub budget: usize,
}

pub fn render_banner(config: &BannerConfig) -> String {
    let mut output = String::with_capacity(512);
    let name = "rpc-server";

    let _ = writeln!(output, "{name} v{}", config.version);
    let _ = writeln!(output, "{}", "=".repeat(name.len() + config.version.len() + 2));
    let _ = writeln!(output);
    let _ = writeln!(output, "Identity:    {}", config.identity);
    let _ = writeln!(output, "Crypto:      {}", config.crypto);
    let _ = writeln!(output, "Buffers:     {}", format_size(config.budget));
    let _ = writeln!(output);

    let _ = writeln!(output, "Listeners:");
    for endpoint in config.listeners {
        let _ = writeln!(output, "  {endpoint}");
    }
    if !config.targets.is_empty() {
        let _ = writeln!(output, "Targets:");
        for t in config.targets {
            let _ = writeln!(
                output,
                "  {} ({}..{} connections)",
                t.endpoint, t.min_connections, t.max_connections
            );
        }
    }
    let _ = writeln!(output);
    output
}

pub fn print_banner(config: &BannerConfig) {
    print!("{}", render_banner(config));
}

/// Format a byte count using the largest unit that divides it.
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;

    if bytes >= GB && bytes.is_multiple_of(GB) {
        format!("{} GB", bytes / GB)
    } else if bytes >= MB && bytes.is_multiple_of(MB) {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB && bytes.is_multiple_of(KB) {
        format!("{} KB", bytes / KB)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(256 * 1024 * 1024), "256 MB");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(1000), "1000 bytes");
    }

    #[test]
    fn lists_listeners_and_targets() {
        let targets: Vec<TargetConfig> = toml::from_str::<crate::config::Config>(
            "[[target]]\nendpoint = \"10.0.0.2:8888\"\nmax_connections = 2",
        )
        .unwrap()
        .targets;
        let banner = render_banner(&BannerConfig {
            version: "0.1.0",
            identity: &ProcessId::default(),
            listeners: &["unix:/tmp/rpc.sock".parse().unwrap()],
            targets: &targets,
            crypto: CryptoSchema::Aes,
            budget: 64 << 20,
        });
        assert!(banner.starts_with("rpc-server v0.1.0\n"));
        assert!(banner.contains("Crypto:      aes"));
        assert!(banner.contains("  unix:/tmp/rpc.sock"));
        assert!(banner.contains("  10.0.0.2:8888 (1..2 connections)"));
    }
}
