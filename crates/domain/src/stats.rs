use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use flowlord_core::print_duration;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::task::{Task, TaskResult};
use crate::tmpl;

/// 执行时长聚合，sum按10ms截断保存以省空间
#[derive(Debug, Clone, Default)]
pub struct DurationStats {
    pub min: Duration,
    pub max: Duration,
    sum: i64,
    count: i64,
}

const PRECISION_MS: i64 = 10;

impl DurationStats {
    pub fn add(&mut self, d: Duration) {
        if self.count == 0 {
            self.min = d;
            self.max = d;
        }
        if d > self.max {
            self.max = d;
        } else if d < self.min {
            self.min = d;
        }
        self.sum += d.num_milliseconds() / PRECISION_MS;
        self.count += 1;
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::zero();
        }
        Duration::milliseconds((self.sum / self.count) * PRECISION_MS)
    }
}

impl std::fmt::Display for DurationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min: {} max: {} avg: {}",
            print_duration(self.min),
            print_duration(self.max),
            print_duration(self.average())
        )
    }
}

/// 单个 type:job 的事件统计
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub completed_count: u64,
    pub completed_times: Vec<DateTime<Utc>>,

    pub error_count: u64,
    pub error_times: Vec<DateTime<Utc>>,

    pub alert_count: u64,
    pub alert_times: Vec<DateTime<Utc>>,

    pub warn_count: u64,
    pub warn_times: Vec<DateTime<Utc>>,

    pub running_count: u64,
    pub running_times: Vec<DateTime<Utc>>,

    pub exec_times: DurationStats,
}

impl Stats {
    pub fn add(&mut self, task: &Task) {
        let tm = tmpl::task_time(task);

        let (count, times) = match task.result {
            TaskResult::Error => (&mut self.error_count, &mut self.error_times),
            TaskResult::Alert => (&mut self.alert_count, &mut self.alert_times),
            TaskResult::Warn => (&mut self.warn_count, &mut self.warn_times),
            TaskResult::Running => (&mut self.running_count, &mut self.running_times),
            TaskResult::Complete => (&mut self.completed_count, &mut self.completed_times),
        };
        *count += 1;
        if let Some(t) = tm {
            times.push(t);
        }

        if task.result == TaskResult::Complete && !task.started.is_empty() && !task.ended.is_empty()
        {
            let start = DateTime::parse_from_rfc3339(&task.started);
            let end = DateTime::parse_from_rfc3339(&task.ended);
            if let (Ok(start), Ok(end)) = (start, end) {
                self.exec_times.add(end.signed_duration_since(start));
            }
        }
    }
}

impl Serialize for Stats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Count {
            #[serde(rename = "Count")]
            count: u64,
            #[serde(rename = "Times")]
            times: String,
        }

        let mut s = serializer.serialize_struct("Stats", 5)?;
        s.serialize_field("min", &print_duration(self.exec_times.min))?;
        s.serialize_field("max", &print_duration(self.exec_times.max))?;
        s.serialize_field("avg", &print_duration(self.exec_times.average()))?;
        s.serialize_field(
            "complete",
            &Count {
                count: self.completed_count,
                times: tmpl::print_dates(&self.completed_times),
            },
        )?;
        s.serialize_field(
            "error",
            &Count {
                count: self.error_count,
                times: tmpl::print_dates(&self.error_times),
            },
        )?;
        s.end()
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.exec_times)?;
        if self.completed_count > 0 {
            write!(
                f,
                "\n\tComplete: {} {}",
                self.completed_count,
                tmpl::print_dates(&self.completed_times)
            )?;
        }
        if self.error_count > 0 {
            write!(
                f,
                "\n\tError: {} {}",
                self.error_count,
                tmpl::print_dates(&self.error_times)
            )?;
        }
        writeln!(f)
    }
}

/// 各结果类型的总量
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub total: u64,
    pub completed: u64,
    pub error: u64,
    pub alert: u64,
    pub warn: u64,
    pub running: u64,
}

/// "type:job" -> 统计，回顾接口的返回主体
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats(pub BTreeMap<String, Stats>);

impl TaskStats {
    pub fn add(&mut self, task: &Task) {
        let key = task.key();
        let key = key.trim_end_matches(':').to_string();
        self.0.entry(key).or_default().add(task);
    }

    pub fn unique_types(&self) -> Vec<String> {
        let mut set = HashSet::new();
        for key in self.0.keys() {
            match key.split_once(':') {
                Some((t, _)) if !t.is_empty() => set.insert(t.to_string()),
                _ => set.insert(key.clone()),
            };
        }
        let mut types: Vec<String> = set.into_iter().collect();
        types.sort();
        types
    }

    pub fn jobs_by_type(&self) -> BTreeMap<String, Vec<String>> {
        let mut jobs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in self.0.keys() {
            if let Some((t, job)) = key.split_once(':') {
                if !job.is_empty() {
                    jobs.entry(t.to_string()).or_default().push(job.to_string());
                }
            }
        }
        for list in jobs.values_mut() {
            list.sort();
        }
        jobs
    }

    pub fn total_counts(&self) -> TaskCounts {
        let mut c = TaskCounts::default();
        for s in self.0.values() {
            c.completed += s.completed_count;
            c.error += s.error_count;
            c.alert += s.alert_count;
            c.warn += s.warn_count;
            c.running += s.running_count;
        }
        c.total = c.completed + c.error + c.alert + c.warn + c.running;
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(result: TaskResult, started: &str, ended: &str) -> Task {
        Task {
            task_type: "task1".to_string(),
            job: "t2".to_string(),
            result,
            started: started.to_string(),
            ended: ended.to_string(),
            created: "2020-05-26T10:00:00Z".to_string(),
            info: "?day=2020-05-26".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_duration_stats_truncates_to_precision() {
        let mut d = DurationStats::default();
        d.add(Duration::milliseconds(105));
        d.add(Duration::milliseconds(215));
        assert_eq!(d.min, Duration::milliseconds(105));
        assert_eq!(d.max, Duration::milliseconds(215));
        // (10 + 21) / 2 = 15 个 10ms 单位
        assert_eq!(d.average(), Duration::milliseconds(150));
    }

    #[test]
    fn test_stats_add_buckets_by_result() {
        let mut s = Stats::default();
        s.add(&task(
            TaskResult::Complete,
            "2020-05-26T10:00:00Z",
            "2020-05-26T10:00:02Z",
        ));
        s.add(&task(TaskResult::Error, "", ""));
        s.add(&task(TaskResult::Running, "", ""));

        assert_eq!(s.completed_count, 1);
        assert_eq!(s.error_count, 1);
        assert_eq!(s.running_count, 1);
        assert_eq!(s.exec_times.max, Duration::seconds(2));
    }

    #[test]
    fn test_stats_exec_time_only_for_completes() {
        let mut s = Stats::default();
        s.add(&task(
            TaskResult::Error,
            "2020-05-26T10:00:00Z",
            "2020-05-26T10:00:09Z",
        ));
        assert_eq!(s.exec_times.max, Duration::zero());
    }

    #[test]
    fn test_stats_json_shape() {
        let mut s = Stats::default();
        s.add(&task(
            TaskResult::Complete,
            "2020-05-26T10:00:00Z",
            "2020-05-26T10:00:01Z",
        ));
        let v: serde_json::Value = serde_json::to_value(&s).unwrap();
        assert_eq!(v["min"], "1s");
        assert_eq!(v["complete"]["Count"], 1);
        assert!(v["error"]["Times"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_task_stats_grouping() {
        let mut ts = TaskStats::default();
        ts.add(&task(TaskResult::Complete, "", ""));
        let mut bare = task(TaskResult::Error, "", "");
        bare.job = String::new();
        ts.add(&bare);

        assert!(ts.0.contains_key("task1:t2"));
        assert!(ts.0.contains_key("task1"));
        assert_eq!(ts.unique_types(), vec!["task1".to_string()]);

        let counts = ts.total_counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.error, 1);
    }
}
