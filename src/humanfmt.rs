use std::time::Duration;

/// Human-readable rendering of sizes, transfer rates and durations for log
/// lines.
#[must_use]
pub(crate) enum HumanFmt {
    Size(u64),
    Rate(u64, Duration),
    Time(Duration),
}

const SIZE_UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
const TIME_UNITS: [&str; 4] = ["ns", "us", "ms", "s"];

/// Writes `value` scaled by 1000 until it fits below 1000 or the units run
/// out, with fewer decimals the larger the scaled value.
fn write_scaled(
    f: &mut std::fmt::Formatter<'_>,
    value: f64,
    units: &[&str],
    suffix: &str,
) -> std::fmt::Result {
    let mut scaled = value;
    let mut unit = 0;
    while scaled >= 1000.0 && unit + 1 < units.len() {
        scaled /= 1000.0;
        unit += 1;
    }

    let precision = match (unit, scaled) {
        (0, _) => 0,
        (_, s) if s > 100.0 => 0,
        (_, s) if s > 10.0 => 1,
        _ => 2,
    };

    write!(f, "{scaled:.precision$}{}{suffix}", units[unit])
}

impl std::fmt::Display for HumanFmt {
    #[expect(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Size(bytes) => write_scaled(f, bytes as f64, &SIZE_UNITS, ""),
            Self::Rate(bytes, elapsed) => {
                let secs = elapsed.as_secs_f64();
                if secs == 0.0 {
                    return f.write_str("???B/s");
                }
                write_scaled(f, bytes as f64 / secs, &SIZE_UNITS, "/s")
            }
            Self::Time(elapsed) => write_scaled(f, elapsed.as_nanos() as f64, &TIME_UNITS, ""),
        }
    }
}
