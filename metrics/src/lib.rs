/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Scoped timers for the engine.
//!
//! Rules run on tokio worker threads and hop between them at every await, so metrics are
//! aggregated in one process-wide registry instead of per thread. Each `scoped_metric!` call site
//! registers its name once and then only touches the registry when the guard drops.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSummary {
    pub name: &'static str,
    pub count: usize,
    pub total_micros: u128,
}

impl MetricSummary {
    pub fn average_micros(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_micros as f64 / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    metrics: Vec<MetricSummary>,
}

impl Registry {
    fn register(&mut self, name: &'static str) -> usize {
        // Two call sites may share a name; they share the row too.
        if let Some(idx) = self.metrics.iter().position(|m| m.name == name) {
            return idx;
        }
        self.metrics.push(MetricSummary {
            name,
            count: 0,
            total_micros: 0,
        });
        self.metrics.len() - 1
    }

    fn record(&mut self, idx: usize, elapsed: Duration) {
        let metric = &mut self.metrics[idx];
        metric.count += 1;
        metric.total_micros += elapsed.as_micros();
    }
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));
static ENABLED: AtomicBool = AtomicBool::new(false);

/// Guard returned by `scoped_metric!`. Records the elapsed time when dropped.
pub struct ScopedMetric {
    metric_index: usize,
    start: Instant,
}

impl ScopedMetric {
    pub fn new(metric_index: usize) -> Self {
        ScopedMetric {
            metric_index,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedMetric {
    fn drop(&mut self) {
        REGISTRY
            .lock()
            .record(self.metric_index, self.start.elapsed());
    }
}

/// Times the rest of the enclosing scope under `$name` when metrics are enabled.
#[macro_export]
macro_rules! scoped_metric {
    ($name:literal) => {
        let _scoped_metric = if $crate::is_enabled() {
            static METRIC: $crate::__private::OnceCell<usize> = $crate::__private::OnceCell::new();
            ::core::option::Option::Some($crate::ScopedMetric::new(
                *METRIC.get_or_init(|| $crate::new_metric($name)),
            ))
        } else {
            ::core::option::Option::None
        };
    };
}

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::OnceCell;
}

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn new_metric(name: &'static str) -> usize {
    REGISTRY.lock().register(name)
}

/// A copy of every metric recorded so far, in registration order.
pub fn summaries() -> Vec<MetricSummary> {
    REGISTRY.lock().metrics.clone()
}

/// Renders the current metrics as a table.
pub struct Table(Vec<MetricSummary>);

pub fn table() -> Table {
    Table(summaries())
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self
            .0
            .iter()
            .map(|m| m.name.len())
            .chain(std::iter::once("metric ".len()))
            .max()
            .unwrap_or(0);
        writeln!(
            f,
            "{:name_width$} {:>6} {:>9} {:>11}",
            "metric ",
            "count",
            "avg (us)",
            "total (us)",
            name_width = name_width
        )?;
        writeln!(
            f,
            "{:-<name_width$} {:-^6} {:-^9} {:-^11}",
            "",
            "",
            "",
            "",
            name_width = name_width
        )?;
        for metric in &self.0 {
            writeln!(
                f,
                "{:name_width$} {: >6} {:>9.3} {:>11}",
                metric.name,
                metric.count,
                metric.average_micros(),
                metric.total_micros,
                name_width = name_width
            )?;
        }
        Ok(())
    }
}

pub fn dump() {
    eprint!("{}", table());
}

#[cfg(test)]
mod test {
    use super::*;

    fn timed() {
        scoped_metric!("timed_in_test");
    }

    #[test]
    fn records_across_threads() {
        enable();
        let handles: Vec<_> = (0..4).map(|_| std::thread::spawn(timed)).collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        timed();
        let summary = summaries()
            .into_iter()
            .find(|m| m.name == "timed_in_test")
            .expect("registered");
        assert_eq!(summary.count, 5);
    }

    #[test]
    fn same_name_shares_a_row() {
        let a = new_metric("shared_name");
        let b = new_metric("shared_name");
        assert_eq!(a, b);
    }

    #[test]
    fn table_has_header() {
        new_metric("table_row");
        let rendered = table().to_string();
        let mut lines = rendered.lines();
        assert!(lines.next().expect("header").starts_with("metric"));
        assert!(lines.next().expect("rule").starts_with("---"));
        assert!(rendered.contains("table_row"));
    }
}
