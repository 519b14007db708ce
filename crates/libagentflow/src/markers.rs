use regex::Regex;
use serde_json::{Value, json};

use crate::config::MarkerConfig;
use crate::error::FireError;

/// What a single output line means to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    IterationStarted(i64),
    CompleteMarker,
    Plain,
}

/// Recognises iteration headers and the completion marker in process output.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    iteration: Regex,
    complete_marker: String,
}

impl MarkerClassifier {
    pub fn new(cfg: &MarkerConfig) -> Result<Self, FireError> {
        Ok(Self {
            iteration: Regex::new(&cfg.iteration_pattern)?,
            complete_marker: cfg.complete_marker.clone(),
        })
    }

    pub fn classify(&self, line: &str) -> LineClass {
        if let Some(caps) = self.iteration.captures(line) {
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
                return LineClass::IterationStarted(n);
            }
        }
        if !self.complete_marker.is_empty() && line.contains(&self.complete_marker) {
            return LineClass::CompleteMarker;
        }
        LineClass::Plain
    }
}

/// Per-run iteration state shared by the stdout and stderr readers.
#[derive(Debug)]
pub struct ProgressTracker {
    tool: String,
    max_iterations: i64,
    iteration: i64,
    complete_reported: Option<i64>,
}

impl ProgressTracker {
    pub fn new(tool: impl Into<String>, max_iterations: i64) -> Self {
        Self {
            tool: tool.into(),
            max_iterations,
            iteration: 0,
            complete_reported: None,
        }
    }

    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    /// Returns the progress payload to publish for a classified line, or
    /// `None` when the line should be published raw.
    pub fn observe(&mut self, class: &LineClass) -> Option<Value> {
        match *class {
            LineClass::IterationStarted(n) => {
                self.iteration = n;
                Some(self.payload("iteration_started", false))
            }
            LineClass::CompleteMarker => {
                if self.complete_reported == Some(self.iteration) {
                    return None;
                }
                self.complete_reported = Some(self.iteration);
                Some(self.payload("complete_detected", true))
            }
            LineClass::Plain => None,
        }
    }

    fn payload(&self, phase: &str, complete_detected: bool) -> Value {
        json!({
            "tool": self.tool,
            "iteration": self.iteration,
            "maxIterations": self.max_iterations,
            "phase": phase,
            "completeDetected": complete_detected,
        })
    }
}
