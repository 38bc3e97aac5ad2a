//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests: a recipe
//! tree staged in a temporary directory, plus a programmatic way to run
//! the scheduler over it.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pkgbulk::core::graph::Graph;
use pkgbulk::core::recipe::{self, RecipeSet};
use pkgbulk::core::report::RunReport;
use pkgbulk::core::scheduler::Scheduler;
use pkgbulk::infra::ledger::Ledger;
use pkgbulk::infra::runner::ProcessRunner;
use pkgbulk::infra::sandbox::{SandboxConfig, SandboxManager};

/// A recipe tree staged in a temporary directory
pub struct RecipeTree {
    /// Temporary directory holding recipes and run state
    pub dir: TempDir,
}

impl RecipeTree {
    /// Create an empty recipe tree
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Recipe tree root
    pub fn recipes_dir(&self) -> PathBuf {
        self.dir.path().join("recipes")
    }

    /// State directory used by harness runs
    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// A scratch path outside the sandboxes, for build commands that need
    /// shared observable state
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join("scratch").join(name)
    }

    /// Add a recipe with the given build dependencies and command
    pub fn add_recipe(&self, category: &str, name: &str, build_deps: &[&str], command: &str) {
        let deps = build_deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let content = format!(
            r#"[package]
category = "{category}"
name = "{name}"

[depends]
build = [{deps}]

[build]
command = '''{command}'''
"#
        );
        self.write_recipe_file(category, name, &content);
    }

    /// Write raw recipe file content (for malformed-recipe tests)
    pub fn write_recipe_file(&self, category: &str, name: &str, content: &str) {
        let dir = self.recipes_dir().join(category).join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create recipe directory");
        std::fs::write(dir.join("recipe.toml"), content).expect("Failed to write recipe");
    }

    /// Load the staged recipes
    pub fn load(&self) -> RecipeSet {
        recipe::load_recipes(&self.recipes_dir()).expect("Failed to load recipes")
    }

    /// Run the scheduler over the staged recipes
    pub async fn run(&self, jobs: usize) -> RunReport {
        self.run_configured(jobs, Duration::from_secs(60), CancellationToken::new())
            .await
    }

    /// Run with an explicit per-build timeout and cancellation token
    pub async fn run_configured(
        &self,
        jobs: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> RunReport {
        std::fs::create_dir_all(self.dir.path().join("scratch")).expect("Failed to create scratch");

        let set = self.load();
        let graph = Graph::build(&set).expect("Recipe set failed validation");
        let ledger = Ledger::open(&self.state_dir().join("pkgbulk.redb"), &set.fingerprint())
            .expect("Failed to open ledger");
        let sandboxes =
            SandboxManager::new(SandboxConfig::new(self.state_dir().join("sandboxes"), jobs))
                .expect("Failed to create sandboxes");
        let runner = ProcessRunner::new(self.state_dir().join("logs"))
            .with_grace(Duration::from_millis(500));

        Scheduler::new(graph, ledger, sandboxes, runner, timeout, cancel)
            .run()
            .await
            .expect("Scheduler run failed")
    }
}

impl Default for RecipeTree {
    fn default() -> Self {
        Self::new()
    }
}
