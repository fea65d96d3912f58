use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering::AcqRel, Ordering::Acquire},
    },
};

use parking_lot::Mutex;

use crate::ThreadContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverageMode {
    #[default]
    Disabled,
    /// count every execution of a line
    Lines,
    /// only record that a line ran at least once
    OneShot,
}

/// Per-file line hit counts, indexed by line number.
#[derive(Debug, Default)]
pub struct Coverage {
    oneshot: bool,
    files: Mutex<HashMap<Arc<str>, Vec<u64>>>,
}

/// Line marker emitted before each covered line.
pub struct CoverLineSite {
    file: Arc<str>,
    line: u32,
    spent: AtomicBool,
}

impl Coverage {
    pub fn new(oneshot: bool) -> Self {
        Self {
            oneshot,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    pub fn record(&self, file: &Arc<str>, line: u32) {
        let mut files = self.files.lock();
        let lines = files.entry(file.clone()).or_default();
        let line = line as usize;
        if lines.len() <= line {
            lines.resize(line + 1, 0);
        }
        lines[line] += 1;
    }

    pub fn line_counts(&self, file: &str) -> Option<Vec<u64>> {
        self.files.lock().get(file).cloned()
    }

    /// Lines that ran at least once, ascending.
    pub fn covered_lines(&self, file: &str) -> Vec<u32> {
        self.files
            .lock()
            .get(file)
            .map(|lines| {
                (0..lines.len() as u32)
                    .filter(|&line| lines[line as usize] > 0)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn files(&self) -> Vec<Arc<str>> {
        self.files.lock().keys().cloned().collect()
    }
}

impl CoverLineSite {
    pub fn new(file: &str, line: u32) -> Self {
        Self {
            file: Arc::from(file),
            line,
            spent: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn cover(&self, ctx: &ThreadContext) {
        if self.spent.load(Acquire) {
            return;
        }
        let Some(coverage) = ctx.runtime().coverage() else {
            return;
        };
        // one-shot sites turn into no-ops after their first hit
        if coverage.is_oneshot() && self.spent.swap(true, AcqRel) {
            return;
        }
        coverage.record(&self.file, self.line);
    }

    pub fn is_spent(&self) -> bool {
        self.spent.load(Acquire)
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, RuntimeCreateInfo};

    fn runtime(coverage: CoverageMode) -> Arc<Runtime> {
        Runtime::new(RuntimeCreateInfo {
            coverage,
            ..Default::default()
        })
    }

    #[test]
    fn line_mode_counts_every_execution() {
        let runtime = runtime(CoverageMode::Lines);
        let ctx = runtime.new_context();
        let site = CoverLineSite::new("lib.rb", 3);
        for _ in 0..5 {
            site.cover(&ctx);
        }
        let coverage = runtime.coverage().unwrap();
        assert_eq!(coverage.line_counts("lib.rb"), Some(vec![0, 0, 0, 5]));
        assert!(!site.is_spent());
    }

    #[test]
    fn oneshot_mode_records_once_then_goes_quiet() {
        let runtime = runtime(CoverageMode::OneShot);
        let ctx = runtime.new_context();
        let sites = [CoverLineSite::new("lib.rb", 1), CoverLineSite::new("lib.rb", 4)];
        for _ in 0..3 {
            for site in &sites {
                site.cover(&ctx);
            }
        }
        let coverage = runtime.coverage().unwrap();
        assert_eq!(coverage.covered_lines("lib.rb"), vec![1, 4]);
        assert_eq!(coverage.line_counts("lib.rb"), Some(vec![0, 1, 0, 0, 1]));
        assert!(sites.iter().all(CoverLineSite::is_spent));
    }

    #[test]
    fn disabled_coverage_records_nothing() {
        let runtime = runtime(CoverageMode::Disabled);
        let ctx = runtime.new_context();
        CoverLineSite::new("lib.rb", 1).cover(&ctx);
        assert!(runtime.coverage().is_none());
    }
}
