// Copyright 2011 Google Inc. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Instant;

/// The metrics module backs the debug mode that dumps timing stats of
/// various actions (-d stats).  The collector is owned by the front-end
/// and threaded to the call sites that sample it.

/// A single metric we're tracking, like "manifest parse time".
pub struct Metric {
    pub name: String,
    /// Number of times we've hit the code path.
    pub count: usize,
    /// Total time (in micros) we've spent on the code path.
    pub sum: u64,
}

/// The collector that stores metrics and prints the report.
#[derive(Default)]
pub struct Metrics {
    metrics: Vec<Metric>,
}

impl Metrics {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record one timed sample of |name|.
    pub fn record(&mut self, name: &str, elapsed_micros: u64) {
        if let Some(metric) = self.metrics.iter_mut().find(|m| m.name == name) {
            metric.count += 1;
            metric.sum += elapsed_micros;
            return;
        }
        self.metrics.push(Metric {
            name: name.to_owned(),
            count: 1,
            sum: elapsed_micros,
        });
    }

    /// Time a closure and record it under |name|.
    pub fn measure<T, F: FnOnce() -> T>(&mut self, name: &str, f: F) -> T {
        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed().as_micros() as u64);
        result
    }

    /// Print a summary report to stdout.
    pub fn report(&self) {
        let width = self
            .metrics
            .iter()
            .map(|m| m.name.len())
            .max()
            .unwrap_or(0);

        println!(
            "{:width$}\t{:6}\t{:9}\t{}",
            "metric",
            "count",
            "avg (us)",
            "total (ms)",
            width = width
        );
        for metric in &self.metrics {
            let total = metric.sum as f64 / 1000.0;
            let avg = metric.sum as f64 / metric.count as f64;
            println!(
                "{:width$}\t{:6}\t{:8.1}\t{:.1}",
                metric.name,
                metric.count,
                avg,
                total,
                width = width
            );
        }
    }
}

/// A simple stopwatch which returns the time in seconds since restart()
/// was called.
#[derive(Default)]
pub struct Stopwatch {
    started: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Default::default()
    }

    /// Seconds since the last restart() call.
    pub fn elapsed(&self) -> f64 {
        match self.started {
            Some(started) => started.elapsed().as_secs_f64(),
            None => 0.0,
        }
    }

    pub fn restart(&mut self) {
        self.started = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_accumulate() {
        let mut metrics = Metrics::new();
        metrics.record("scan", 10);
        metrics.record("scan", 30);
        metrics.record("parse", 5);
        assert_eq!(2, metrics.metrics.len());
        assert_eq!(2, metrics.metrics[0].count);
        assert_eq!(40, metrics.metrics[0].sum);
        assert_eq!(1, metrics.metrics[1].count);
    }

    #[test]
    fn stopwatch_starts_at_zero() {
        let sw = Stopwatch::new();
        assert_eq!(0.0, sw.elapsed());
    }
}
