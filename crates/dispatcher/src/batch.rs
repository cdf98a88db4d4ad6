use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use flowlord_core::{FlowlordError, FlowlordResult};
use flowlord_domain::{tmpl, Meta, Task, DATE_HOUR};

/// 批量任务展开：在一个时间窗口内按步长生成任务，
/// 可选按meta行做笛卡尔展开（内联 meta=k:v1|v2 或行式JSON文件）。
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub template: String,
    pub task: String,
    pub job: String,
    pub workflow: String,
    /// hour | day | week | month，缺省day
    pub by: String,
    pub meta: Vec<(String, String)>,
    pub metafile: String,
}

impl Batch {
    /// 单个时间点的任务
    pub fn at(&self, t: DateTime<Utc>) -> FlowlordResult<Vec<Task>> {
        self.range(t, t)
    }

    /// [start, start+dur] 窗口内的任务
    pub fn for_window(&self, start: DateTime<Utc>, dur: Duration) -> FlowlordResult<Vec<Task>> {
        self.range(start, start + dur)
    }

    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> FlowlordResult<Vec<Task>> {
        if !self.metafile.is_empty() && !self.meta.is_empty() {
            return Err(FlowlordError::Scheduling(
                "meta-file 与 meta 不能同时使用".to_string(),
            ));
        }
        let mut data = expand_meta(&self.meta)?;
        if !self.metafile.is_empty() {
            data = read_metafile(&self.metafile)?;
            if data.is_empty() && start == end {
                return Ok(Vec::new());
            }
        }

        let step = by_iterator(&self.by);
        let (start, end, reverse) = if end < start {
            (end, start, true)
        } else {
            (start, end, false)
        };

        let mut tasks = Vec::new();
        let mut t = start;
        while t <= end {
            let info = tmpl::render(&self.template, Some(t));
            let mut meta = Meta::new();
            meta.set("cron", t.format(DATE_HOUR).to_string());
            if !self.workflow.is_empty() {
                meta.set("workflow", self.workflow.clone());
            }
            if !self.job.is_empty() {
                meta.set("job", self.job.clone());
            }

            if data.is_empty() {
                let mut tsk = Task::new(self.task.clone(), info.clone());
                tsk.job = self.job.clone();
                tsk.meta = meta.encode();
                tasks.push(tsk);
            }
            for row in &data {
                let (row_info, keys) = tmpl::meta_substitute(&info, row);
                let mut tsk = Task::new(self.task.clone(), row_info);
                tsk.job = self.job.clone();
                let mut row_meta = meta.clone();
                for k in keys {
                    let v = row.get(&k).to_string();
                    row_meta.set(k, v);
                }
                tsk.meta = row_meta.encode();
                tasks.push(tsk);
            }
            t = step(t);
        }
        if reverse {
            tasks.reverse();
        }
        Ok(tasks)
    }
}

fn by_iterator(by: &str) -> fn(DateTime<Utc>) -> DateTime<Utc> {
    match by.to_lowercase().as_str() {
        "hour" | "hourly" => |t| t + Duration::hours(1),
        "week" | "weekly" => |t| t + Duration::days(7),
        "month" | "monthly" => add_month,
        _ => |t| t + Duration::days(1),
    }
}

fn add_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (y, m) = (t.year(), t.month());
    let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
    let day = t.day();
    // 月底溢出时回退到目标月最后一天
    let date = (0..4)
        .filter_map(|back| NaiveDate::from_ymd_opt(ny, nm, day.saturating_sub(back).max(1)))
        .next()
        .unwrap_or(t.date_naive());
    Utc.from_utc_datetime(
        &date
            .and_hms_opt(t.hour(), t.minute(), t.second())
            .unwrap_or_default(),
    )
}

/// 内联meta展开： [(k, "v1|v2"), ...] -> 每个下标一行，各键取值数必须一致
fn expand_meta(pairs: &[(String, String)]) -> FlowlordResult<Vec<Meta>> {
    let mut rows: Vec<Meta> = Vec::new();
    for (key, joined) in pairs {
        let values: Vec<&str> = joined.split('|').collect();
        if rows.is_empty() {
            rows = vec![Meta::new(); values.len()];
        }
        if values.len() != rows.len() {
            return Err(FlowlordError::Scheduling(format!(
                "meta 各键取值数不一致 {} != {}",
                values.len(),
                rows.len()
            )));
        }
        for (i, v) in values.iter().enumerate() {
            rows[i].set(key.clone(), v.to_string());
        }
    }
    Ok(rows)
}

/// 行式JSON meta文件，每行一个扁平对象
fn read_metafile(path: &str) -> FlowlordResult<Vec<Meta>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FlowlordError::Scheduling(format!("meta文件 {path} 读取失败: {e}")))?;
    let mut rows = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let map: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_str(line)
                .map_err(|e| FlowlordError::Scheduling(format!("meta文件 {path}: {e}")))?;
        let mut row = Meta::new();
        for (k, v) in map {
            let s = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            row.set(k, s);
        }
        rows.push(row);
    }
    Ok(rows)
}
