//! Progress reports and per-level outputs of a run.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::Serialize;

use crate::align::Assignment;
use crate::class::Class;
use crate::error::Cl2dResult;

/// One round of one level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationReport {
    pub level: usize,
    pub iteration: usize,
    pub classes: usize,
    /// Sum of the winning scores divided by the number of images.
    pub average_similarity: f64,
    /// Images whose class changed since the previous round; 0 on the first.
    pub changes: usize,
    pub class_sizes: Vec<usize>,
}

/// A committed class as written to the outputs.
#[derive(Debug, Clone, Serialize)]
pub struct ClassSummary {
    pub index: usize,
    pub size: usize,
    pub prototype: Array2<f64>,
    pub members: Vec<Assignment>,
}

impl ClassSummary {
    pub fn of(index: usize, class: &Class) -> Self {
        Self {
            index,
            size: class.len(),
            prototype: class.prototype().clone(),
            members: class.members().to_vec(),
        }
    }
}

/// Everything known about a level, after one of its rounds or at its end.
#[derive(Debug, Clone, Serialize)]
pub struct LevelReport {
    pub level: usize,
    pub iterations: Vec<IterationReport>,
    pub classes: Vec<ClassSummary>,
}

/// Receives run outputs on the root worker. All hooks default to no-ops.
pub trait RunObserver: Send {
    fn iteration_completed(&mut self, _report: &IterationReport) -> Cl2dResult<()> {
        Ok(())
    }

    /// Called after every class commit; meant for debugging dumps.
    fn class_committed(
        &mut self,
        _level: usize,
        _iteration: usize,
        _index: usize,
        _class: &Class,
    ) -> Cl2dResult<()> {
        Ok(())
    }

    /// Called after every round with the classes as they stand.
    fn level_progress(&mut self, _report: &LevelReport) -> Cl2dResult<()> {
        Ok(())
    }

    fn level_completed(&mut self, _report: &LevelReport) -> Cl2dResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl RunObserver for NullObserver {}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    pub iterations: Vec<IterationReport>,
    pub levels: Vec<LevelReport>,
    pub commits: usize,
    pub progress: usize,
}

impl RunObserver for MemoryObserver {
    fn iteration_completed(&mut self, report: &IterationReport) -> Cl2dResult<()> {
        self.iterations.push(report.clone());
        Ok(())
    }

    fn class_committed(
        &mut self,
        _level: usize,
        _iteration: usize,
        _index: usize,
        _class: &Class,
    ) -> Cl2dResult<()> {
        self.commits += 1;
        Ok(())
    }

    fn level_progress(&mut self, _report: &LevelReport) -> Cl2dResult<()> {
        self.progress += 1;
        Ok(())
    }

    fn level_completed(&mut self, report: &LevelReport) -> Cl2dResult<()> {
        self.levels.push(report.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct LevelInfo<'a> {
    level: usize,
    iterations: &'a [IterationReport],
}

/// Writes `<root>_classes_level_NN.json` and `<root>_info_level_NN.json`
/// into a directory after every round, and once more at the end of the level.
#[derive(Debug, Clone)]
pub struct JsonDirectoryWriter {
    dir: PathBuf,
    root: String,
}

impl JsonDirectoryWriter {
    pub fn new(dir: impl Into<PathBuf>, root: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            root: root.into(),
        }
    }

    pub fn classes_path(&self, level: usize) -> PathBuf {
        self.dir
            .join(format!("{}_classes_level_{:02}.json", self.root, level))
    }

    pub fn info_path(&self, level: usize) -> PathBuf {
        self.dir
            .join(format!("{}_info_level_{:02}.json", self.root, level))
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Cl2dResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, value)?;
        tracing::debug!(path = %path.display(), "wrote level output");
        Ok(())
    }

    fn write_level(&self, report: &LevelReport) -> Cl2dResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        Self::write_json(&self.classes_path(report.level), &report.classes)?;
        Self::write_json(
            &self.info_path(report.level),
            &LevelInfo {
                level: report.level,
                iterations: &report.iterations,
            },
        )
    }
}

impl RunObserver for JsonDirectoryWriter {
    fn level_progress(&mut self, report: &LevelReport) -> Cl2dResult<()> {
        self.write_level(report)
    }

    fn level_completed(&mut self, report: &LevelReport) -> Cl2dResult<()> {
        self.write_level(report)
    }
}
