//! ISO-8601 durations as used by the PIM APIs (`PT8H`, `P90D`, `PT1H30M`).
//!
//! Years and months are rejected: their length depends on the calendar and the
//! remote service normalizes them inconsistently.

use chrono::Duration;

/// Parse an ISO-8601 duration consisting of weeks, days, hours, minutes and seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let rest = s
        .strip_prefix('P')
        .ok_or_else(|| format!("duration '{}' must start with 'P'", input))?;
    if rest.is_empty() {
        return Err(format!("duration '{}' has no components", input));
    }

    let mut total = Duration::zero();
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for ch in rest.chars() {
        match ch {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' => number.push(ch),
            unit => {
                if number.is_empty() {
                    return Err(format!("duration '{}' has a unit without a value", input));
                }
                let value: i64 = number.parse().map_err(|_| out_of_range(input))?;
                number.clear();
                let component = match (in_time, unit) {
                    (false, 'W') => Duration::try_weeks(value),
                    (false, 'D') => Duration::try_days(value),
                    (true, 'H') => Duration::try_hours(value),
                    (true, 'M') => Duration::try_minutes(value),
                    (true, 'S') => Duration::try_seconds(value),
                    (false, 'Y') | (false, 'M') => {
                        return Err(format!(
                            "duration '{}' uses years or months; use days instead",
                            input
                        ))
                    }
                    _ => return Err(format!("duration '{}' has unexpected '{}'", input, unit)),
                };
                total = component
                    .and_then(|c| total.checked_add(&c))
                    .ok_or_else(|| out_of_range(input))?;
                saw_component = true;
            }
        }
    }

    if !number.is_empty() || !saw_component {
        return Err(format!("duration '{}' is incomplete", input));
    }
    Ok(total)
}

fn out_of_range(input: &str) -> String {
    format!("duration '{}' is out of range", input)
}

/// Format a duration in the canonical form the PIM APIs emit.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    if total == 0 {
        return "PT0S".to_string();
    }
    if total % 86_400 == 0 {
        return format!("P{}D", total / 86_400);
    }

    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{}D", days));
    }
    out.push('T');
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if seconds > 0 {
        out.push_str(&format!("{}S", seconds));
    }
    out
}

/// Human-readable form for reports (e.g. "45 min", "8 hours", "90 days").
pub fn humanize(duration: Duration) -> String {
    let total_minutes = duration.num_minutes();

    if total_minutes < 1 {
        "< 1 min".to_string()
    } else if total_minutes < 60 {
        format!("{} min", total_minutes)
    } else if total_minutes % (24 * 60) == 0 {
        let days = total_minutes / (24 * 60);
        format!("{} day{}", days, if days == 1 { "" } else { "s" })
    } else {
        let hours = total_minutes / 60;
        let mins = total_minutes % 60;
        if mins == 0 {
            format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            format!("{}h {}m", hours, mins)
        }
    }
}
