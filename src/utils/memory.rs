//! Memory release and size formatting helpers.

/// Return freed memory to the OS after large buffers are dropped.
///
/// Accelerator memory held by candle tensors is released when the tensors
/// drop; this covers the host allocator.
pub fn clean_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // glibc keeps freed arenas mapped until asked
        unsafe extern "C" {
            fn malloc_trim(pad: usize) -> i32;
        }
        let released = unsafe { malloc_trim(0) };
        tracing::trace!("malloc_trim released memory: {}", released != 0);
    }

    #[cfg(any(feature = "cuda", feature = "metal"))]
    tracing::trace!("Accelerator buffers released with their tensors");
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Parse a memory size such as `6GiB`, `500MB` or `1024`.
///
/// Binary suffixes (`KiB`, `MiB`, `GiB`, `TiB`) are powers of 1024, decimal
/// ones (`KB`, `MB`, `GB`, `TB`) powers of 1000. Case-insensitive.
pub fn parse_size(s: &str) -> crate::Result<u64> {
    const UNITS: [(&str, u64); 9] = [
        ("TIB", 1 << 40),
        ("GIB", 1 << 30),
        ("MIB", 1 << 20),
        ("KIB", 1 << 10),
        ("TB", 1_000_000_000_000),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("KB", 1_000),
        ("B", 1),
    ];

    let trimmed = s.trim();
    let upper = trimmed.to_uppercase();
    let invalid = || crate::FetchError::ConfigError(format!("Invalid memory size '{}'", trimmed));

    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|n| (n.trim(), *mult)))
        .unwrap_or((upper.as_str(), 1));

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }

    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok((value * multiplier as f64) as u64)
}
