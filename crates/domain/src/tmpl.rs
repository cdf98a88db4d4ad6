use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use crate::task::{Meta, Task, DATE_HOUR};

/// 按给定时间渲染info模板。支持的占位符：
///
/// {YYYY} 四位年    {YY} 两位年    {MM} 月    {DD} 日    {HH} 小时    {min} 分钟
/// {TS} 紧凑时间戳 YYYYMMDDThhmmss
/// {SLUG}/{HOUR_SLUG} = {YYYY}/{MM}/{DD}/{HH}
/// {DAY_SLUG} = {YYYY}/{MM}/{DD}    {MONTH_SLUG} = {YYYY}/{MM}
/// {HOST} 主机名    {POD} k8s pod后缀    {UUID} 8位随机id（只替换首个）
///
/// 日期类占位符大小写均可；"#"之后的内容原样保留；时间为None时模板原样返回。
pub fn render(template: &str, t: Option<DateTime<Utc>>) -> String {
    let t = match t {
        Some(t) => t,
        None => return template.to_string(),
    };

    let (mut s, end) = match template.find('#') {
        Some(i) if i > 0 => (template[..i].to_string(), &template[i..]),
        _ => (template.to_string(), ""),
    };

    s = s.replace("{SLUG}", "{HOUR_SLUG}");
    s = s.replace("{HOUR_SLUG}", "{YYYY}/{MM}/{DD}/{HH}");
    s = s.replace("{DAY_SLUG}", "{YYYY}/{MM}/{DD}");
    s = s.replace("{MONTH_SLUG}", "{YYYY}/{MM}");
    s = s.replace("{TS}", &t.format("%Y%m%dT%H%M%S").to_string());

    let year = t.format("%Y").to_string();
    for token in ["{YYYY}", "{yyyy}"] {
        s = s.replace(token, &year);
    }
    for token in ["{YY}", "{yy}"] {
        s = s.replace(token, &year[2..]);
    }
    let month = t.format("%m").to_string();
    for token in ["{MM}", "{mm}"] {
        s = s.replace(token, &month);
    }
    let day = t.format("%d").to_string();
    for token in ["{DD}", "{dd}"] {
        s = s.replace(token, &day);
    }
    let hour = t.format("%H").to_string();
    for token in ["{HH}", "{hh}"] {
        s = s.replace(token, &hour);
    }
    s = s.replace("{min}", &t.format("%M").to_string());

    let host = host_name();
    for token in ["{HOST}", "{host}"] {
        s = s.replace(token, &host);
    }
    // pod名只保留末尾的两段唯一id
    let parts: Vec<&str> = host.split('-').collect();
    let pod = if parts.len() > 1 {
        parts[parts.len() - 2..].join("-")
    } else {
        host.clone()
    };
    for token in ["{POD}", "{pod}"] {
        s = s.replace(token, &pod);
    }

    if s.contains("{uuid}") || s.contains("{UUID}") {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        s = s.replacen("{uuid}", &id, 1);
        s = s.replacen("{UUID}", &id, 1);
    }

    s + end
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "hostname".to_string())
}

/// 替换 {meta:key} 占位符并返回所有被引用的键
pub fn meta_substitute(template: &str, meta: &Meta) -> (String, Vec<String>) {
    let mut out = template.to_string();
    let mut keys = Vec::new();

    let mut search = 0;
    while let Some(start) = out[search..].find("{meta:") {
        let start = search + start;
        let key_start = start + "{meta:".len();
        let Some(close) = out[key_start..].find('}') else {
            break;
        };
        let key = out[key_start..key_start + close].to_string();
        if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            let value = meta.get(&key).to_string();
            out = out.replace(&format!("{{meta:{key}}}"), &value);
            keys.push(key);
            search = start;
        } else {
            search = key_start + close + 1;
        }
    }

    (out, keys)
}

/// 模式匹配：'d'表示数字，其他字符为字面量，返回首个匹配的窗口
fn find_pattern(s: &str, pattern: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let pat = pattern.as_bytes();
    if bytes.len() < pat.len() {
        return None;
    }
    'outer: for start in 0..=bytes.len() - pat.len() {
        for (i, &p) in pat.iter().enumerate() {
            let b = bytes[start + i];
            let ok = if p == b'd' { b.is_ascii_digit() } else { b == p };
            if !ok {
                continue 'outer;
            }
        }
        return Some(s[start..start + pat.len()].to_string());
    }
    None
}

fn ymd(y: &str, m: &str, d: &str, hour: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)?;
    let dt = date.and_hms_opt(hour, 0, 0)?;
    Some(Utc.from_utc_datetime(&dt))
}

/// 从文件路径中提取时间，按优先级尝试以下布局：
/// 文件名 YYYYMMDDThhmmss、小时slug Y/M/D/H、日slug Y/M/D、日横杠 Y-M-D、月slug Y/M
pub fn path_time(path: &str) -> Option<DateTime<Utc>> {
    let file_name = path.rsplit('/').next().unwrap_or(path);

    if let Some(m) = find_pattern(file_name, "ddddddddTdddddd") {
        let dt = chrono::NaiveDateTime::parse_from_str(&m, "%Y%m%dT%H%M%S").ok()?;
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Some(m) = find_pattern(path, "dddd/dd/dd/dd") {
        return ymd(&m[0..4], &m[5..7], &m[8..10], m[11..13].parse().ok()?);
    }
    if let Some(m) = find_pattern(path, "dddd/dd/dd") {
        return ymd(&m[0..4], &m[5..7], &m[8..10], 0);
    }
    if let Some(m) = find_pattern(path, "dddd-dd-dd") {
        return ymd(&m[0..4], &m[5..7], &m[8..10], 0);
    }
    if let Some(m) = find_pattern(path, "dddd/dd") {
        return ymd(&m[0..4], &m[5..7], "1", 0);
    }
    None
}

pub fn parse_date_hour(s: &str) -> Option<DateTime<Utc>> {
    if s.len() < 13 {
        return None;
    }
    let date = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d").ok()?;
    let hour: u32 = s[11..13].parse().ok()?;
    if s.as_bytes()[10] != b'T' || hour > 23 {
        return None;
    }
    Some(Utc.from_utc_datetime(&date.and_hms_opt(hour, 0, 0)?))
}

/// 从info串提取时间。优先级：
/// ?time|timestamp=RFC3339 > ?hour|date=YYYY-MM-DDThh > ?day|date=YYYY-MM-DD > 路径时间
pub fn info_time(info: &str) -> Option<DateTime<Utc>> {
    let (path, query) = match info.split_once('?') {
        Some((p, q)) => (p, q),
        None => (info, ""),
    };
    let params = Meta::parse(query);

    for key in ["time", "timestamp", "day", "date"] {
        let v = params.get(key);
        if v.is_empty() {
            continue;
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(v) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for key in ["hour", "hour_utc", "date"] {
        if let Some(t) = parse_date_hour(params.get(key)) {
            return Some(t);
        }
    }
    for key in ["day", "date"] {
        if let Ok(d) = NaiveDate::parse_from_str(params.get(key), "%Y-%m-%d") {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }

    path_time(path)
}

/// 任务的业务时间：meta的cron时间戳 > info中的时间参数 > 路径时间
pub fn task_time(task: &Task) -> Option<DateTime<Utc>> {
    if let Some(t) = parse_date_hour(task.parsed_meta().get("cron")) {
        return Some(t);
    }
    info_time(&task.info)
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

fn is_consecutive(t1: DateTime<Utc>, t2: DateTime<Utc>, gran: Granularity) -> bool {
    if t1 == t2 {
        return true;
    }
    match gran {
        Granularity::Hourly => t2 - t1 == chrono::Duration::hours(1),
        Granularity::Daily => (t2.date_naive() - t1.date_naive()).num_days() == 1,
        Granularity::Monthly => {
            let next = next_month(t1.date_naive());
            t2.date_naive().format("%Y-%m").to_string() == next.format("%Y-%m").to_string()
        }
    }
}

fn next_month(d: NaiveDate) -> NaiveDate {
    use chrono::Datelike;
    let (y, m) = (d.year(), d.month());
    let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1).unwrap_or(d)
}

fn format_gran(t: DateTime<Utc>, gran: Granularity) -> String {
    match gran {
        Granularity::Monthly => t.format("%Y/%m").to_string(),
        Granularity::Daily => t.format("%Y/%m/%d").to_string(),
        Granularity::Hourly => t.format("%Y/%m/%dT%H").to_string(),
    }
}

/// 把一组时间压缩为紧凑的区间展示，粒度（小时/天/月）自动检测。
/// 例: "2020/01/01-2020/01/05" 或 "2020/01/02T15-2020/01/02T18"
pub fn print_dates(dates: &[DateTime<Utc>]) -> String {
    if dates.is_empty() {
        return String::new();
    }
    let mut dates = dates.to_vec();
    dates.sort();

    if dates.len() == 1 {
        return dates[0].format("%Y/%m/%dT%H").to_string();
    }

    // 同月重复出现则降级为日粒度，同日重复则降级为小时粒度
    let mut gran = Granularity::Monthly;
    let mut months = std::collections::HashSet::new();
    let mut days = std::collections::HashSet::new();
    for (i, t) in dates.iter().enumerate() {
        if i > 0 && *t == dates[i - 1] {
            continue;
        }
        let month_key = t.format("%Y-%m").to_string();
        let day_key = t.format("%Y-%m-%d").to_string();
        if !months.insert(month_key) && gran == Granularity::Monthly {
            gran = Granularity::Daily;
        }
        if !days.insert(day_key) && gran == Granularity::Daily {
            gran = Granularity::Hourly;
        }
    }

    let mut out = String::new();
    let mut range_start = dates[0];
    let mut prev = dates[0];
    let mut in_range = false;

    let mut close_range = |out: &mut String, start: DateTime<Utc>, end: DateTime<Utc>, in_range: bool| {
        if in_range && start != end {
            out.push_str(&format_gran(start, gran));
            out.push('-');
            out.push_str(&format_gran(end, gran));
        } else {
            out.push_str(&start.format("%Y/%m/%dT%H").to_string());
        }
    };

    for &curr in &dates[1..] {
        if is_consecutive(prev, curr, gran) {
            in_range = true;
            prev = curr;
            continue;
        }
        close_range(&mut out, range_start, prev, in_range);
        out.push(',');
        range_start = curr;
        prev = curr;
        in_range = false;
    }
    close_range(&mut out, range_start, prev, in_range);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_render_basic_tokens() {
        let t = Utc.with_ymd_and_hms(2018, 1, 2, 3, 17, 34).unwrap();
        assert_eq!(
            render("{YYYY}-{MM}-{DD}T{HH}:{min}", Some(t)),
            "2018-01-02T03:17"
        );
        assert_eq!(
            render("?date={yyyy}-{mm}-{dd}T{hh}", Some(t)),
            "?date=2018-01-02T03"
        );
        assert_eq!(render("{YY}", Some(t)), "18");
        assert_eq!(render("{TS}", Some(t)), "20180102T031734");
    }

    #[test]
    fn test_render_slugs() {
        let t = at(2018, 1, 2, 3);
        assert_eq!(render("base/{SLUG}/f.json", Some(t)), "base/2018/01/02/03/f.json");
        assert_eq!(render("{DAY_SLUG}", Some(t)), "2018/01/02");
        assert_eq!(render("{MONTH_SLUG}", Some(t)), "2018/01");
    }

    #[test]
    fn test_render_zero_time_unchanged() {
        assert_eq!(render("{YYYY}-{MM}", None), "{YYYY}-{MM}");
    }

    #[test]
    fn test_render_preserves_comment() {
        let t = at(2018, 1, 2, 3);
        assert_eq!(
            render("?day={DD} # note {MM}", Some(t)),
            "?day=02 # note {MM}"
        );
    }

    #[test]
    fn test_render_uuid_once() {
        let t = at(2018, 1, 2, 3);
        let out = render("{UUID}-{UUID}", Some(t));
        assert!(out.contains("{UUID}"));
        let id = out.split('-').next().unwrap();
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn test_meta_substitute() {
        let mut m = Meta::new();
        m.set("file", "s3://bucket/data.json");
        m.set("count", "5");
        let (out, keys) = meta_substitute("?f={meta:file}&n={meta:count}", &m);
        assert_eq!(out, "?f=s3://bucket/data.json&n=5");
        assert_eq!(keys, vec!["file".to_string(), "count".to_string()]);
    }

    #[test]
    fn test_meta_substitute_missing_key_empty() {
        let (out, keys) = meta_substitute("?v={meta:nope}", &Meta::new());
        assert_eq!(out, "?v=");
        assert_eq!(keys, vec!["nope".to_string()]);
    }

    #[test]
    fn test_path_time_layouts() {
        assert_eq!(
            path_time("/path/20180102T030405.txt").unwrap(),
            Utc.with_ymd_and_hms(2018, 1, 2, 3, 4, 5).unwrap()
        );
        assert_eq!(path_time("/p/2018/01/02/03/f.txt").unwrap(), at(2018, 1, 2, 3));
        assert_eq!(path_time("/p/2018/01/02/f.txt").unwrap(), at(2018, 1, 2, 0));
        assert_eq!(path_time("/p/2018-01-02.txt").unwrap(), at(2018, 1, 2, 0));
        assert_eq!(path_time("/p/2018/01/f.txt").unwrap(), at(2018, 1, 1, 0));
        assert!(path_time("/p/none.txt").is_none());
    }

    #[test]
    fn test_info_time_priority() {
        assert_eq!(
            info_time("?time=2018-01-02T03:04:05Z").unwrap(),
            Utc.with_ymd_and_hms(2018, 1, 2, 3, 4, 5).unwrap()
        );
        assert_eq!(info_time("?hour=2018-01-02T03").unwrap(), at(2018, 1, 2, 3));
        assert_eq!(info_time("?day=2018-01-02").unwrap(), at(2018, 1, 2, 0));
        assert_eq!(
            info_time("/p/2018/01/02/03/f.txt?x=1").unwrap(),
            at(2018, 1, 2, 3)
        );
    }

    #[test]
    fn test_task_time_prefers_cron_meta() {
        let t = Task {
            info: "?day=2019-05-05".to_string(),
            meta: "cron=2020-01-01T06".to_string(),
            ..Default::default()
        };
        assert_eq!(task_time(&t).unwrap(), at(2020, 1, 1, 6));

        let t2 = Task {
            info: "?day=2019-05-05".to_string(),
            ..Default::default()
        };
        assert_eq!(task_time(&t2).unwrap(), at(2019, 5, 5, 0));
    }

    #[test]
    fn test_print_dates_daily_range() {
        let dates: Vec<_> = (1..=5).map(|d| at(2020, 1, d, 0)).collect();
        assert_eq!(print_dates(&dates), "2020/01/01-2020/01/05");
    }

    #[test]
    fn test_print_dates_hourly_range() {
        let dates: Vec<_> = (10..=13).map(|h| at(2020, 1, 2, h)).collect();
        assert_eq!(print_dates(&dates), "2020/01/02T10-2020/01/02T13");
    }

    #[test]
    fn test_print_dates_single_and_gap() {
        assert_eq!(print_dates(&[at(2020, 3, 4, 7)]), "2020/03/04T07");

        let dates = vec![at(2020, 1, 1, 0), at(2020, 1, 2, 0), at(2020, 1, 10, 0)];
        assert_eq!(print_dates(&dates), "2020/01/01-2020/01/02,2020/01/10T00");
    }
}
