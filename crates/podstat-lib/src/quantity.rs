//! Kubernetes quantity parsing and formatting
//!
//! Quantities such as `500m`, `1.5`, `128Mi` or `1G` are converted into
//! integer millicores (CPU) and bytes (memory) so that ledger arithmetic is
//! exact.

use crate::error::{PodStatError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const KI: f64 = 1024.0;
const GIB: f64 = KI * KI * KI;

/// Parse a quantity string into its value in base units (cores, bytes)
pub fn parse_quantity(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    if number.is_empty() {
        return Err(PodStatError::InvalidQuantity(raw.to_string()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| PodStatError::InvalidQuantity(raw.to_string()))?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => KI,
        "Mi" => KI.powi(2),
        "Gi" => KI.powi(3),
        "Ti" => KI.powi(4),
        "Pi" => KI.powi(5),
        "Ei" => KI.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let power: i32 = exp[1..]
                .parse()
                .map_err(|_| PodStatError::InvalidQuantity(raw.to_string()))?;
            10f64.powi(power)
        }
        _ => return Err(PodStatError::InvalidQuantity(raw.to_string())),
    };

    Ok(value * multiplier)
}

/// Round up to an integer, tolerating float noise such as `100.00000000000001`
fn ceil_tolerant(value: f64) -> u64 {
    let rounded = value.round();
    if (value - rounded).abs() < 1e-6 {
        rounded as u64
    } else {
        value.ceil() as u64
    }
}

/// Parse a CPU quantity into millicores (rounded up like the API server does)
pub fn cpu_millis(quantity: &Quantity) -> Result<u64> {
    parse_quantity(&quantity.0).map(|cores| ceil_tolerant(cores * 1000.0))
}

/// Parse a memory quantity into bytes
pub fn memory_bytes(quantity: &Quantity) -> Result<u64> {
    parse_quantity(&quantity.0).map(ceil_tolerant)
}

/// Format millicores as a Kubernetes quantity (`500m`, `2`)
pub fn format_cpu_millis(millis: u64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{}m", millis)
    }
}

/// Format bytes as a binary Kubernetes quantity when it divides evenly
pub fn format_memory_bytes(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];

    for (suffix, size) in UNITS {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{}", bytes / size, suffix);
        }
    }
    format!("{}", bytes)
}

/// Millicores as cores with two decimals
pub fn cores_2dp(millis: u64) -> String {
    format!("{:.2}", millis as f64 / 1000.0)
}

/// Bytes as GiB with two decimals
pub fn gib_2dp(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / GIB)
}

/// `part` as a percentage of `total` with two decimals, `"0"` if unknown
pub fn percent(part: u64, total: u64) -> String {
    if total == 0 {
        return "0".to_string();
    }
    format!("{:.2}", part as f64 / total as f64 * 100.0)
}
