//! A small repetition harness: named cases, a fixed iteration count, manually
//! or automatically timed iterations, and a summary table.

use std::time::Duration;

use instant::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeUnit {
    Nanosecond,
    #[default]
    Microsecond,
    Millisecond,
}

impl TimeUnit {
    pub fn suffix(self) -> &'static str {
        match self {
            TimeUnit::Nanosecond => "ns",
            TimeUnit::Microsecond => "us",
            TimeUnit::Millisecond => "ms",
        }
    }

    pub fn convert(self, duration: Duration) -> f64 {
        match self {
            TimeUnit::Nanosecond => duration.as_secs_f64() * 1e9,
            TimeUnit::Microsecond => duration.as_secs_f64() * 1e6,
            TimeUnit::Millisecond => duration.as_secs_f64() * 1e3,
        }
    }
}

/// Per-case iteration state handed to the case body.
#[derive(Debug)]
pub struct BenchState {
    max_iterations: u64,
    iterations: u64,
    manual_time: bool,
    times: Vec<Duration>,
    last: Option<Instant>,
    bytes_processed: Option<u64>,
}

impl BenchState {
    fn new(max_iterations: u64, manual_time: bool) -> Self {
        Self {
            max_iterations,
            iterations: 0,
            manual_time,
            times: Vec::new(),
            last: None,
            bytes_processed: None,
        }
    }

    /// Returns `true` while another iteration should run.
    ///
    /// Without manual timing, the wall time between consecutive calls is
    /// recorded as the iteration time.
    pub fn keep_running(&mut self) -> bool {
        let now = Instant::now();
        if !self.manual_time {
            if let Some(last) = self.last {
                self.times.push(now - last);
            }
        }
        if self.iterations >= self.max_iterations {
            return false;
        }
        self.iterations += 1;
        self.last = Some(Instant::now());
        true
    }

    /// Records the duration of the current iteration. Only used with manual
    /// timing.
    pub fn set_iteration_time(&mut self, duration: Duration) {
        if self.manual_time {
            self.times.push(duration);
        }
    }

    pub fn set_bytes_processed(&mut self, bytes: u64) {
        self.bytes_processed = Some(bytes);
    }

    /// Iterations started so far.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

type CaseFn<'a> = Box<dyn FnMut(&mut BenchState) -> Result<()> + 'a>;

pub struct Case<'a> {
    name: String,
    body: CaseFn<'a>,
    manual_time: bool,
    unit: TimeUnit,
}

impl Case<'_> {
    pub fn use_manual_time(&mut self) -> &mut Self {
        self.manual_time = true;
        self
    }

    pub fn unit(&mut self, unit: TimeUnit) -> &mut Self {
        self.unit = unit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
pub struct Registry<'a> {
    cases: Vec<Case<'a>>,
}

impl<'a> Registry<'a> {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        body: impl FnMut(&mut BenchState) -> Result<()> + 'a,
    ) -> &mut Case<'a> {
        self.cases.push(Case {
            name: name.into(),
            body: Box::new(body),
            manual_time: false,
            unit: TimeUnit::default(),
        });
        let last = self.cases.len() - 1;
        &mut self.cases[last]
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub name: String,
    pub iterations: u64,
    pub unit: TimeUnit,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub bytes_processed: Option<u64>,
}

impl CaseReport {
    fn from_state(name: String, unit: TimeUnit, state: &BenchState) -> Self {
        let total: Duration = state.times.iter().sum();
        let samples = u32::try_from(state.times.len()).unwrap_or(u32::MAX);
        Self {
            name,
            iterations: state.iterations,
            unit,
            mean: if samples == 0 {
                Duration::ZERO
            } else {
                total / samples
            },
            min: state.times.iter().min().copied().unwrap_or_default(),
            max: state.times.iter().max().copied().unwrap_or_default(),
            bytes_processed: state.bytes_processed,
        }
    }

    /// Bytes processed per second of measured time.
    pub fn throughput(&self) -> Option<f64> {
        let total = self.mean.as_secs_f64() * self.iterations as f64;
        match self.bytes_processed {
            Some(bytes) if total > 0.0 => Some(bytes as f64 / total),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<CaseReport>,
    pub failures: Vec<(String, Error)>,
}

impl RunSummary {
    pub fn print(&self) {
        println!();
        println!("{:-<104}", "");
        println!(
            "{:<50} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "Benchmark", "Mean", "Min", "Max", "Iters", "GB/s"
        );
        println!("{:-<104}", "");
        for report in &self.reports {
            let unit = report.unit;
            let throughput = report
                .throughput()
                .map(|t| format!("{:.2}", t / 1e9))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<50} {:>8.1}{} {:>8.1}{} {:>8.1}{} {:>10} {:>10}",
                report.name,
                unit.convert(report.mean),
                unit.suffix(),
                unit.convert(report.min),
                unit.suffix(),
                unit.convert(report.max),
                unit.suffix(),
                report.iterations,
                throughput
            );
        }
        for (name, err) in &self.failures {
            println!("{name:<50} ERROR: {err}");
        }
        println!("{:-<104}", "");
    }
}

pub struct Runner {
    iterations: u64,
    filter: Option<String>,
}

impl Runner {
    pub fn new(iterations: u64) -> Self {
        Self {
            iterations,
            filter: None,
        }
    }

    /// Only run cases whose name contains `filter`.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    /// Runs every selected case in registration order. A failing case is
    /// logged and recorded but does not stop the remaining ones.
    pub fn run(&self, registry: Registry<'_>) -> RunSummary {
        let mut summary = RunSummary::default();
        for mut case in registry.cases {
            if let Some(filter) = &self.filter {
                if !case.name.contains(filter.as_str()) {
                    log::debug!("skipping {} (filter {filter:?})", case.name);
                    continue;
                }
            }

            log::info!("running {}", case.name);
            let mut state = BenchState::new(self.iterations, case.manual_time);
            match (case.body)(&mut state) {
                Ok(()) => {
                    summary
                        .reports
                        .push(CaseReport::from_state(case.name, case.unit, &state));
                }
                Err(err) => {
                    log::error!("{} failed: {err}", case.name);
                    summary.failures.push((case.name, err));
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_time_statistics() {
        let mut registry = Registry::new();
        registry
            .register("case", |state: &mut BenchState| {
                let mut micros = 10;
                while state.keep_running() {
                    state.set_iteration_time(Duration::from_micros(micros));
                    micros += 10;
                }
                state.set_bytes_processed(state.iterations() * 1000);
                Ok(())
            })
            .use_manual_time()
            .unit(TimeUnit::Microsecond);

        let summary = Runner::new(3).run(registry);
        assert!(summary.failures.is_empty());
        let report = &summary.reports[0];
        assert_eq!(report.iterations, 3);
        assert_eq!(report.mean, Duration::from_micros(20));
        assert_eq!(report.min, Duration::from_micros(10));
        assert_eq!(report.max, Duration::from_micros(30));
        assert_eq!(report.bytes_processed, Some(3000));
        // 3000 bytes over 60us.
        let throughput = report.throughput().unwrap();
        assert!((throughput - 5.0e7).abs() < 1.0, "{throughput}");
    }

    #[test]
    fn failing_case_does_not_stop_the_run() {
        let mut registry = Registry::new();
        registry.register("bad", |_: &mut BenchState| {
            Err(Error::InvalidCase("nope".into()))
        });
        registry.register("good", |state: &mut BenchState| {
            while state.keep_running() {}
            Ok(())
        });

        let summary = Runner::new(5).run(registry);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "bad");
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].iterations, 5);
        assert_eq!(summary.reports[0].bytes_processed, None);
    }

    #[test]
    fn filter_selects_by_substring() {
        let mut registry = Registry::new();
        for name in ["gpu/scalar/1048576", "gpu/vector/1048576"] {
            registry.register(name, |state: &mut BenchState| {
                while state.keep_running() {}
                Ok(())
            });
        }
        let summary = Runner::new(1)
            .with_filter(Some("vector".into()))
            .run(registry);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].name, "gpu/vector/1048576");
    }

    #[test]
    fn automatic_timing_records_every_iteration() {
        let mut state = BenchState::new(4, false);
        while state.keep_running() {}
        assert_eq!(state.iterations(), 4);
        assert_eq!(state.times.len(), 4);
    }
}
