//! Output formatting utilities

use crate::OutputFormat;
use serde::Serialize;

/// Print a list of values in the specified format
pub fn print_list<T: Serialize + std::fmt::Display>(
    values: &[T],
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(values)?);
        }
        OutputFormat::Human => {
            for value in values {
                println!("{}", value);
            }
        }
    }
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Shorten a URL for a progress line, keeping its tail
pub fn short_url(url: &str, max: usize) -> String {
    let chars: Vec<char> = url.chars().collect();
    if chars.len() <= max || max < 4 {
        return url.to_string();
    }
    let tail: String = chars[chars.len() - (max - 3)..].iter().collect();
    format!("...{}", tail)
}
