use std::time::Duration;

use crate::Error;

const SECONDS_IN_HOUR: u64 = 60 * 60;
const SECONDS_IN_MINUTE: u64 = 60;

// The gRPC spec bounds TimeoutValue at 8 digits, which also rules out
// integer overflow in the unit conversions below.
const MAX_TIMEOUT_DIGITS: usize = 8;
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Parse a `grpc-timeout` header value: an ASCII integer of at most eight
/// digits followed by a single unit suffix.
///
/// The `n` suffix is honored as true nanoseconds (1 n = 1e-9 s).
pub(crate) fn parse_grpc_timeout(value: &str) -> Result<Duration, Error> {
    if value.len() < 2 || !value.is_ascii() {
        return Err(Error::Protocol(format!(
            "malformed grpc-timeout value {:?}",
            value
        )));
    }

    let (timeout_value, timeout_unit) = value.split_at(value.len() - 1);

    if timeout_value.len() > MAX_TIMEOUT_DIGITS {
        return Err(Error::Protocol(format!(
            "grpc-timeout value {:?} exceeds {} digits",
            value, MAX_TIMEOUT_DIGITS
        )));
    }

    let timeout_value: u64 = timeout_value
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed grpc-timeout value {:?}", value)))?;

    let duration = match timeout_unit {
        "H" => Duration::from_secs(timeout_value * SECONDS_IN_HOUR),
        "M" => Duration::from_secs(timeout_value * SECONDS_IN_MINUTE),
        "S" => Duration::from_secs(timeout_value),
        "m" => Duration::from_millis(timeout_value),
        "u" => Duration::from_micros(timeout_value),
        "n" => Duration::from_nanos(timeout_value),
        unit => {
            return Err(Error::Protocol(format!("unknown timeout unit: {}", unit)));
        }
    };

    Ok(duration)
}

/// Format a `Duration` as a `grpc-timeout` value, using the finest unit whose
/// value fits in eight digits. Values are rounded up so a deadline is never
/// shortened by the encoding.
pub(crate) fn format_grpc_timeout(duration: Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos <= MAX_TIMEOUT_VALUE {
        format!("{}n", nanos)
    } else if nanos.div_ceil(1_000) <= MAX_TIMEOUT_VALUE {
        format!("{}u", nanos.div_ceil(1_000))
    } else if nanos.div_ceil(1_000_000) <= MAX_TIMEOUT_VALUE {
        format!("{}m", nanos.div_ceil(1_000_000))
    } else if nanos.div_ceil(1_000_000_000) <= MAX_TIMEOUT_VALUE {
        format!("{}S", nanos.div_ceil(1_000_000_000))
    } else if nanos.div_ceil(1_000_000_000 * SECONDS_IN_MINUTE as u128) <= MAX_TIMEOUT_VALUE {
        format!(
            "{}M",
            nanos.div_ceil(1_000_000_000 * SECONDS_IN_MINUTE as u128)
        )
    } else {
        let hours = nanos
            .div_ceil(1_000_000_000 * SECONDS_IN_HOUR as u128)
            .min(MAX_TIMEOUT_VALUE);
        format!("{}H", hours)
    }
}
