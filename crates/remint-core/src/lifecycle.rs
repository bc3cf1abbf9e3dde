//! Up/down lifecycle hooks for host migration runners.
//!
//! Runners sequence migrations and expect a completion callback. [`run_hook`]
//! adapts a [`Migration`]'s returned result to that convention.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

use crate::controller::{MigrationController, MigrationError, MigrationSummary};

/// Future returned by lifecycle hooks.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<HookOutcome, MigrationError>> + Send + 'a>>;

/// Which hook to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(format!("unknown direction: {s}. Expected up or down")),
        }
    }
}

/// What a hook did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HookOutcome {
    /// The migration ran to completion.
    Applied(MigrationSummary),
    /// Nothing to do in this direction.
    Skipped { reason: String },
}

/// A named, one-way migration.
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    fn up(&self) -> HookFuture<'_>;

    fn down(&self) -> HookFuture<'_>;
}

/// Retypes legacy records and re-derives their identifiers.
///
/// The rewrite loses the legacy type, so `down` cannot restore it and does
/// nothing.
#[derive(Debug)]
pub struct EntityRetypeMigration {
    controller: MigrationController,
}

impl EntityRetypeMigration {
    #[must_use]
    pub fn new(controller: MigrationController) -> Self {
        Self { controller }
    }
}

impl Migration for EntityRetypeMigration {
    fn name(&self) -> &str {
        &self.controller.settings().name
    }

    fn up(&self) -> HookFuture<'_> {
        Box::pin(async move { self.controller.run().await.map(HookOutcome::Applied) })
    }

    fn down(&self) -> HookFuture<'_> {
        Box::pin(async move {
            info!(migration = %self.name(), "down is a no-op for this migration");
            Ok(HookOutcome::Skipped {
                reason: "retyping is not reversible".to_string(),
            })
        })
    }
}

/// Run one hook and hand its result to `done`.
pub async fn run_hook<F>(migration: &dyn Migration, direction: Direction, done: F)
where
    F: FnOnce(Result<HookOutcome, MigrationError>),
{
    info!(migration = %migration.name(), %direction, "running migration hook");
    let result = match direction {
        Direction::Up => migration.up().await,
        Direction::Down => migration.down().await,
    };
    done(result);
}
