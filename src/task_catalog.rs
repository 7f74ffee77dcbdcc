//! Task catalog (C2): immutable, process-wide task definitions with
//! forgiving step validators, mirroring the once-loaded, read-only
//! `SHIP_TEMPLATES` table in the teacher's `ship.rs`.

use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{debug, warn};

/// A single step's validator. Intentionally forgiving, per spec §4.2:
/// case-insensitive substring matches, and digit-stripping for numeric
/// codes, because the input is free text typed by an autonomous client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepValidator {
    /// Accept iff the (lowercased, trimmed) input contains `expected`.
    ContainsCaseInsensitive { expected: String },
    /// Accept iff the digits extracted from the input equal `expected_digits`.
    NumericCode { expected_digits: String },
    /// Accept any non-empty input (e.g. "swipe card", "align engine").
    AnyNonEmpty,
}

impl StepValidator {
    #[must_use]
    pub fn validate(&self, input: &str) -> bool {
        match self {
            StepValidator::ContainsCaseInsensitive { expected } => {
                input.to_lowercase().contains(&expected.to_lowercase())
            }
            StepValidator::NumericCode { expected_digits } => {
                let digits: String = input.chars().filter(char::is_ascii_digit).collect();
                digits == *expected_digits
            }
            StepValidator::AnyNonEmpty => !input.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    ShortTask,
    LongTask,
    CommonTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub display_name: String,
    pub task_type: TaskType,
    pub room: String,
    pub steps: Vec<StepValidator>,
    pub prerequisite_task_id: Option<String>,
    pub is_multi_part: bool,
}

impl Task {
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Result of validating one step's input against a task (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub accepted: bool,
    pub completed: bool,
    pub next_step: usize,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct TaskCatalog {
    tasks: HashMap<String, Task>,
}

impl TaskCatalog {
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Self {
        TaskCatalog {
            tasks: tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    #[must_use]
    pub fn all_ids(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    /// Fisher-Yates selection of `n` distinct task ids, without replacement.
    ///
    /// # Panics
    /// Never panics; if `n` exceeds the catalog size, the whole catalog is
    /// returned (shuffled) rather than erroring, since the caller (the
    /// session engine) is expected to clamp `n` to the catalog size itself.
    #[must_use]
    pub fn assign_random(&self, n: usize, rng: &mut SmallRng) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.keys().cloned().collect();
        ids.shuffle(rng);
        if n > ids.len() {
            warn!(
                "(TaskCatalog.assign_random) Requested {} tasks but catalog only has {}; returning all.",
                n,
                ids.len()
            );
            ids
        } else {
            ids.truncate(n);
            ids
        }
    }

    /// Validate free-text `input` against `task`'s step `step`.
    #[must_use]
    pub fn validate(&self, task_id: &str, input: &str, step: usize) -> ValidationResult {
        let Some(task) = self.get(task_id) else {
            return ValidationResult {
                accepted: false,
                completed: false,
                next_step: step,
                message: format!("unknown task '{task_id}'"),
            };
        };
        let Some(validator) = task.steps.get(step) else {
            return ValidationResult {
                accepted: false,
                completed: false,
                next_step: step,
                message: "no such step".to_string(),
            };
        };
        if !validator.validate(input) {
            debug!("(TaskCatalog.validate) Rejected input for task {} step {}.", task_id, step);
            return ValidationResult {
                accepted: false,
                completed: false,
                next_step: step,
                message: "input did not satisfy the step".to_string(),
            };
        }
        let next_step = step + 1;
        let completed = next_step >= task.steps.len();
        ValidationResult {
            accepted: true,
            completed,
            next_step: if completed { step } else { next_step },
            message: if completed { "task completed".to_string() } else { "step accepted".to_string() },
        }
    }
}

fn default_tasks() -> Vec<Task> {
    vec![
        Task {
            task_id: "fuel-download".to_string(),
            display_name: "Download Fuel Data".to_string(),
            task_type: TaskType::ShortTask,
            room: "navigation".to_string(),
            steps: vec![StepValidator::AnyNonEmpty],
            prerequisite_task_id: None,
            is_multi_part: true,
        },
        Task {
            task_id: "fuel-upload".to_string(),
            display_name: "Upload Fuel Data".to_string(),
            task_type: TaskType::ShortTask,
            room: "shields".to_string(),
            steps: vec![StepValidator::AnyNonEmpty],
            prerequisite_task_id: Some("fuel-download".to_string()),
            is_multi_part: true,
        },
        Task {
            task_id: "wiring-electrical".to_string(),
            display_name: "Fix Wiring (Electrical)".to_string(),
            task_type: TaskType::CommonTask,
            room: "electrical".to_string(),
            steps: vec![StepValidator::ContainsCaseInsensitive { expected: "connected".to_string() }],
            prerequisite_task_id: None,
            is_multi_part: false,
        },
        Task {
            task_id: "keycard-admin".to_string(),
            display_name: "Swipe Keycard".to_string(),
            task_type: TaskType::ShortTask,
            room: "admin".to_string(),
            steps: vec![StepValidator::ContainsCaseInsensitive { expected: "swipe".to_string() }],
            prerequisite_task_id: None,
            is_multi_part: false,
        },
        Task {
            task_id: "reactor-startup".to_string(),
            display_name: "Start Reactor".to_string(),
            task_type: TaskType::LongTask,
            room: "reactor".to_string(),
            steps: vec![
                StepValidator::NumericCode { expected_digits: "1357".to_string() },
                StepValidator::NumericCode { expected_digits: "2468".to_string() },
            ],
            prerequisite_task_id: None,
            is_multi_part: true,
        },
        Task {
            task_id: "align-engine-upper".to_string(),
            display_name: "Align Engine Output".to_string(),
            task_type: TaskType::ShortTask,
            room: "upper_engine".to_string(),
            steps: vec![StepValidator::ContainsCaseInsensitive { expected: "aligned".to_string() }],
            prerequisite_task_id: None,
            is_multi_part: false,
        },
        Task {
            task_id: "calibrate-sensors".to_string(),
            display_name: "Calibrate Distributor".to_string(),
            task_type: TaskType::CommonTask,
            room: "navigation".to_string(),
            steps: vec![StepValidator::ContainsCaseInsensitive { expected: "calibrated".to_string() }],
            prerequisite_task_id: None,
            is_multi_part: false,
        },
        Task {
            task_id: "medbay-scan".to_string(),
            display_name: "Submit Medical Scan".to_string(),
            task_type: TaskType::ShortTask,
            room: "medbay".to_string(),
            steps: vec![StepValidator::AnyNonEmpty],
            prerequisite_task_id: None,
            is_multi_part: false,
        },
    ]
}

pub static DEFAULT_TASK_CATALOG: Lazy<TaskCatalog> = Lazy::new(|| TaskCatalog::new(default_tasks()));
