//! Parses textual resource limit specs into [`ResourceLimits`].
//!
//! Pure and side-effect-free: no filesystem or cgroup access happens here.
//! The caller is responsible for reading the source text, whether that's a
//! config file or an RPC payload field.

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoLimit {
    pub device: Option<DeviceId>,
    pub bytes_per_sec: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Fraction of a single CPU core, in hundredths of a percent (e.g. 150
    /// for "150%"). `None` means unlimited.
    pub cpu_percent_hundredths: Option<u32>,
    /// `cgroup.cpu.max`'s period; the kernel requires quota and period both.
    pub cpu_period_us: u32,
    /// Memory ceiling in bytes. `None` means unlimited.
    pub memory_bytes: Option<u64>,
    /// Per-device (or device-less, applying to all devices) I/O throughput
    /// ceilings.
    pub io_limits: Vec<IoLimit>,
}

const DEFAULT_CPU_PERIOD_US: u32 = 100_000;
const MIN_MEMORY_BYTES: u64 = 1024 * 1024;
const MIN_IO_BYTES_PER_SEC: u64 = 1024;

impl ResourceLimits {
    pub fn unlimited() -> Self {
        ResourceLimits {
            cpu_percent_hundredths: None,
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
            memory_bytes: None,
            io_limits: Vec::new(),
        }
    }

    /// Computes the `cpu.max` quota (microseconds per period) implied by the
    /// configured percentage, or `None` if unlimited.
    pub fn cpu_quota_us(&self) -> Option<u64> {
        self.cpu_percent_hundredths
            .map(|pct| (pct as u64 * self.cpu_period_us as u64) / 10_000)
    }

    /// Renders this back into the text format [`parse`] accepts. Round-trips
    /// through `parse` to an equal value for any limits `parse` can produce.
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        if let Some(hundredths) = self.cpu_percent_hundredths {
            let whole = hundredths / 100;
            let frac = hundredths % 100;
            if frac == 0 {
                out.push_str(&format!("cpu: {whole}%\n"));
            } else {
                out.push_str(&format!("cpu: {whole}.{frac:02}%\n"));
            }
        }

        if let Some(bytes) = self.memory_bytes {
            out.push_str(&format!("memory: {}\n", format_byte_amount(bytes)));
        }

        for io in &self.io_limits {
            let rate = format_byte_amount(io.bytes_per_sec);
            match io.device {
                Some(d) => out.push_str(&format!("io: {}:{} {rate}/s\n", d.major, d.minor)),
                None => out.push_str(&format!("io: {rate}/s\n")),
            }
        }

        out
    }
}

/// Inverse of [`parse_byte_amount`]: picks the largest power-of-1024 unit
/// that divides `bytes` evenly, falling back to a bare byte count.
fn format_byte_amount(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;
    if bytes != 0 && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes != 0 && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes != 0 && bytes % KIB == 0 {
        format!("{}K", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// Parses a limits block of the form:
///
/// ```text
/// cpu: 150%
/// memory: 512M
/// io: 8:0 50M/s
/// io: 10M/s
/// ```
///
/// Blank lines and lines starting with `#` are ignored. Each recognized line
/// updates the corresponding field; `io:` lines accumulate.
pub fn parse(text: &str) -> Result<ResourceLimits, ParseError> {
    // Upper bound on CPU percent is derived from the host's core count (the
    // "100% per core allowance" the spec describes), not from parsed text,
    // but reading it is a pure query (no filesystem access) so parsing stays
    // as side-effect-free as the rest of this module for test purposes.
    let max_cpu_hundredths = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
        .saturating_mul(100 * 100);

    let mut limits = ResourceLimits::unlimited();
    let mut saw_any = false;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (kind, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::UnknownKind(line.to_string()))?;
        let kind = kind.trim();
        let value = value.trim();

        match kind {
            "cpu" => {
                limits.cpu_percent_hundredths = Some(parse_cpu_percent(value, max_cpu_hundredths)?);
            }
            "memory" => {
                limits.memory_bytes = Some(parse_memory(value)?);
            }
            "io" => {
                limits.io_limits.push(parse_io(value)?);
            }
            other => return Err(ParseError::UnknownKind(other.to_string())),
        }
        saw_any = true;
    }

    if !saw_any {
        return Err(ParseError::Empty);
    }
    Ok(limits)
}

/// Parses `"150%"` into hundredths-of-a-percent (`15000`), rejecting values
/// above `max_hundredths` (the host's core count times 100%).
fn parse_cpu_percent(s: &str, max_hundredths: u32) -> Result<u32, ParseError> {
    let digits = s
        .strip_suffix('%')
        .ok_or_else(|| ParseError::InvalidCpu(s.to_string()))?;
    let value: f64 = digits
        .parse()
        .map_err(|_| ParseError::InvalidCpu(s.to_string()))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ParseError::InvalidCpu(s.to_string()));
    }
    let hundredths = (value * 100.0).round() as u32;
    if hundredths > max_hundredths {
        return Err(ParseError::OutOfRange {
            field: "cpu",
            raw: s.to_string(),
        });
    }
    Ok(hundredths)
}

/// Parses `"512M"`, `"4G"`, `"128K"`, or a bare byte count, powers of 1024.
fn parse_memory(s: &str) -> Result<u64, ParseError> {
    let bytes = parse_byte_amount(s).map_err(|_| ParseError::InvalidMemory(s.to_string()))?;
    if bytes < MIN_MEMORY_BYTES {
        return Err(ParseError::OutOfRange {
            field: "memory",
            raw: s.to_string(),
        });
    }
    Ok(bytes)
}

/// Parses `"50M/s"` or `"8:0 50M/s"`.
fn parse_io(s: &str) -> Result<IoLimit, ParseError> {
    let (device_part, rate_part) = match s.split_once(char::is_whitespace) {
        Some((dev, rate)) => (Some(dev), rate.trim()),
        None => (None, s),
    };

    let device = match device_part {
        Some(dev) => Some(parse_device(dev)?),
        None => None,
    };

    let rate_str = rate_part
        .strip_suffix("/s")
        .ok_or_else(|| ParseError::InvalidIoBandwidth(s.to_string()))?;
    let bytes_per_sec =
        parse_byte_amount(rate_str).map_err(|_| ParseError::InvalidIoBandwidth(s.to_string()))?;
    if bytes_per_sec < MIN_IO_BYTES_PER_SEC {
        return Err(ParseError::OutOfRange {
            field: "io",
            raw: s.to_string(),
        });
    }

    Ok(IoLimit {
        device,
        bytes_per_sec,
    })
}

fn parse_device(s: &str) -> Result<DeviceId, ParseError> {
    let (major, minor) = s
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidDevice(s.to_string()))?;
    let major = major
        .parse()
        .map_err(|_| ParseError::InvalidDevice(s.to_string()))?;
    let minor = minor
        .parse()
        .map_err(|_| ParseError::InvalidDevice(s.to_string()))?;
    Ok(DeviceId { major, minor })
}

/// Parses a byte amount with an optional `K`/`M`/`G` suffix (powers of 1024)
/// or a bare integer number of bytes.
fn parse_byte_amount(s: &str) -> Result<u64, ()> {
    let (digits, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits.parse().map_err(|_| ())?;
    value.checked_mul(multiplier).ok_or(())
}
