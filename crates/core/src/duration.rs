use chrono::Duration;

use crate::errors::{FlowlordError, FlowlordResult};

/// 解析 "300ms"、"-1.5h"、"2h45m" 这类持续时间字符串。
/// 支持的单位: ns、us、ms、s、m、h，可带符号和小数。
pub fn parse_duration(s: &str) -> FlowlordResult<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FlowlordError::config("空的持续时间"));
    }
    if s == "0" {
        return Ok(Duration::zero());
    }

    let (neg, mut rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let mut total_ns: i64 = 0;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| FlowlordError::config(format!("持续时间缺少单位: {s:?}")))?;
        if num_end == 0 {
            return Err(FlowlordError::config(format!("无效的持续时间: {s:?}")));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| FlowlordError::config(format!("无效的持续时间: {s:?}")))?;

        let unit_rest = &rest[num_end..];
        let (unit_ns, unit_len) = if unit_rest.starts_with("ns") {
            (1i64, 2)
        } else if unit_rest.starts_with("us") || unit_rest.starts_with("µs") {
            (1_000, if unit_rest.starts_with("µs") { "µs".len() } else { 2 })
        } else if unit_rest.starts_with("ms") {
            (1_000_000, 2)
        } else if unit_rest.starts_with('s') {
            (1_000_000_000, 1)
        } else if unit_rest.starts_with('m') {
            (60 * 1_000_000_000, 1)
        } else if unit_rest.starts_with('h') {
            (3600 * 1_000_000_000, 1)
        } else {
            return Err(FlowlordError::config(format!(
                "未知的持续时间单位: {s:?}"
            )));
        };

        total_ns += (value * unit_ns as f64) as i64;
        rest = &unit_rest[unit_len..];
    }

    let d = Duration::nanoseconds(total_ns);
    Ok(if neg { -d } else { d })
}

/// 紧凑的持续时间展示，面向日志和meta字段，如 "250ms"、"4h"、"1h30m"。
pub fn print_duration(d: Duration) -> String {
    let neg = d < Duration::zero();
    let d = if neg { -d } else { d };
    let ms = d.num_milliseconds();

    let out = if ms < 1_000 {
        format!("{ms}ms")
    } else {
        let secs = d.num_seconds();
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{h}h"));
        }
        if m > 0 {
            out.push_str(&format!("{m}m"));
        }
        if s > 0 || out.is_empty() {
            out.push_str(&format!("{s}s"));
        }
        out
    };

    if neg {
        format!("-{out}")
    } else {
        out
    }
}
