use std::{fmt, future::Future};

use crate::{VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Collects the outcome of a sequence of best-effort teardown steps.
///
/// Every step runs regardless of whether earlier steps failed. Failures are recorded with the
/// name of the step so callers can log or inspect them afterwards.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    completed: Vec<String>,
    failures: Vec<TeardownFailure>,
}

/// A teardown step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// The name of the step.
    pub step: String,

    /// The rendered error.
    pub error: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TeardownReport {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of a step that already ran.
    pub fn record<T>(&mut self, step: &str, result: VirshboxResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.completed.push(step.to_string());
                Some(value)
            }
            Err(e) => {
                tracing::warn!(step = step, error = %e, "teardown step failed, continuing");
                self.failures.push(TeardownFailure {
                    step: step.to_string(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    /// Runs a step and records its result.
    pub async fn step<T, F>(&mut self, step: &str, fut: F) -> Option<T>
    where
        F: Future<Output = VirshboxResult<T>>,
    {
        let result = fut.await;
        self.record(step, result)
    }

    /// Whether every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The steps that succeeded, in order.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// The steps that failed, in order.
    pub fn failures(&self) -> &[TeardownFailure] {
        &self.failures
    }

    /// Converts the report into an error if any step failed.
    pub fn into_result(self) -> VirshboxResult<()> {
        if self.is_clean() {
            return Ok(());
        }

        Err(VirshboxError::custom(anyhow::anyhow!("{self}")))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} step(s) completed, {} failed",
            self.completed.len(),
            self.failures.len()
        )?;

        for failure in &self.failures {
            write!(f, "; {}: {}", failure.step, failure.error)?;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_teardown_continues_past_failures() {
        let mut report = TeardownReport::new();

        report
            .step("destroy", async {
                Err::<(), _>(VirshboxError::InvalidArgument("not running".into()))
            })
            .await;
        let value = report.step("undefine", async { Ok(7) }).await;
        report.record("remove", Ok(()));

        assert_eq!(value, Some(7));
        assert!(!report.is_clean());
        assert_eq!(report.completed(), &["undefine", "remove"]);
        assert_eq!(report.failures().len(), 1);
        assert_eq!(report.failures()[0].step, "destroy");
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_clean_report_is_ok() {
        let mut report = TeardownReport::new();
        report.record("a", Ok(()));
        assert!(report.is_clean());
        assert!(report.into_result().is_ok());
    }
}
