use chrono::Utc;
use log::info;
use std::str::FromStr;

/// Sets up fern logging to stdout. `level` is one of the `log` level names.
pub fn setup_logging(level: &str) -> Result<(), fern::InitError> {
    let level = log::LevelFilter::from_str(level).unwrap_or(log::LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("tungstenite", log::LevelFilter::Warn)
        .level_for("tokio_tungstenite", log::LevelFilter::Warn)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("rustls", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized at level {}.", level);
    Ok(())
}

pub fn unix_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fixed six-decimal rendering used wherever a float becomes part of a key.
pub fn float_to_string(value: f64) -> String {
    format!("{:.6}", value)
}

/// Rounds `value` down to a whole multiple of `step`. A non-positive step leaves the value as is.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    // Nudge by a relative epsilon so 0.3 / 0.1 does not floor to 2
    let steps = (value / step * (1.0 + 1e-12)).floor();
    // Trim representation noise to the step's own precision
    let scale = 10f64.powi(step_decimals(step) as i32);
    let snap = |steps: f64| (steps * step * scale).round() / scale;
    let floored = snap(steps);
    // The nudge may have crossed a boundary the value sits just under
    if floored > value {
        snap(steps - 1.0)
    } else {
        floored
    }
}

/// Number of decimals needed to render `step` exactly (capped at 12).
pub fn step_decimals(step: f64) -> usize {
    let mut decimals = 0usize;
    let mut scaled = step;
    while decimals < 12 && (scaled - scaled.round()).abs() > 1e-9 * scaled.abs().max(1.0) {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}

/// Renders a quantity or price as the exchange expects it for the given step size.
pub fn format_with_step(value: f64, step: f64) -> String {
    if step <= 0.0 {
        return format!("{}", value);
    }
    format!("{:.*}", step_decimals(step), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_floor_to_step() {
        assert_approx_eq!(floor_to_step(1.2347, 0.001), 1.234, 1e-12);
        assert_approx_eq!(floor_to_step(0.3, 0.1), 0.3, 1e-12);
        assert_approx_eq!(floor_to_step(5.0, 1.0), 5.0, 1e-12);
        assert_approx_eq!(floor_to_step(0.00099, 0.001), 0.0, 1e-12);
        assert_approx_eq!(floor_to_step(2.5, 0.0), 2.5, 1e-12);
    }

    #[test]
    fn test_floor_to_step_never_exceeds_value() {
        assert_eq!(floor_to_step(1.2349999999999, 0.001), 1.234);
        assert_eq!(floor_to_step(0.99999999999999, 0.01), 0.99);
        assert_eq!(floor_to_step(9.989999999999999, 0.01), 9.98);
        for value in [1.2349999999999, 0.3, 0.7, 1.0 - 1e-13, 42.0, 9.99] {
            for step in [0.1, 0.01, 0.001, 1.0] {
                assert!(floor_to_step(value, step) <= value, "{} / {}", value, step);
            }
        }
    }

    #[test]
    fn test_float_to_string_uses_six_decimals() {
        assert_eq!(float_to_string(0.1), "0.100000");
        assert_eq!(float_to_string(1.0000004), "1.000000");
    }

    #[test]
    fn test_format_with_step() {
        assert_eq!(step_decimals(0.001), 3);
        assert_eq!(step_decimals(1.0), 0);
        assert_eq!(format_with_step(1.234, 0.001), "1.234");
        assert_eq!(format_with_step(0.000001, 0.000001), "0.000001");
    }
}
