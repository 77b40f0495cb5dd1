//! Process CPU and memory sampling via procfs.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcSample {
    pub cpu_percent: f64,
    pub rss_mb: f64,
}

/// Stateful sampler: CPU% is computed from the tick delta between two
/// consecutive samples.
pub struct ProcSampler {
    ticks_per_second: f64,
    page_size: u64,
    last: Option<(u64, Instant)>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            // Both values are fixed at 100/4096 on the Linux targets we
            // run on; procfs readers below fail soft anyway.
            ticks_per_second: 100.0,
            page_size: 4096,
            last: None,
        }
    }

    /// Takes one sample; the first call reports 0% CPU.
    pub fn sample(&mut self) -> ProcSample {
        let now = Instant::now();
        let ticks = read_self_stat_ticks().unwrap_or(0);
        let rss_pages = read_self_statm_rss().unwrap_or(0);

        let cpu_percent = match self.last {
            Some((prev_ticks, prev_at)) if ticks >= prev_ticks => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    let cpu_seconds = (ticks - prev_ticks) as f64 / self.ticks_per_second;
                    100.0 * cpu_seconds / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        self.last = Some((ticks, now));

        ProcSample {
            cpu_percent,
            rss_mb: (rss_pages * self.page_size) as f64 / (1024.0 * 1024.0),
        }
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn read_self_stat_ticks() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_stat_ticks(&text)
}

fn read_self_statm_rss() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm_rss(&text)
}

/// utime + stime from `/proc/<pid>/stat`. The comm field may contain
/// spaces, so fields are counted from after the closing paren.
fn parse_stat_ticks(text: &str) -> Option<u64> {
    let rest = &text[text.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Fields after comm: state is index 0, utime is 11, stime is 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Second field of `/proc/<pid>/statm` is resident pages.
fn parse_statm_rss(text: &str) -> Option<u64> {
    text.split_whitespace().nth(1)?.parse().ok()
}
