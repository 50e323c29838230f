//! Grade source adapters. Each one exposes a grading scheme as a uniform
//! per-student list and keeps the last good list when a refresh fails.

pub mod assignment;
pub mod traditional;

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{GatewayError, GradebookError};
use crate::notify::{Notice, Notifier};

/// Cached output of one adapter.
#[derive(Debug, Clone)]
pub struct GradeSource<T> {
    label: &'static str,
    items: Vec<T>,
    loading: bool,
    revision: u64,
}

impl<T> GradeSource<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            items: Vec::new(),
            loading: false,
            revision: 0,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    /// Bumped on every successful refresh.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Runs `fetch` and replaces the cached list with its result.
    ///
    /// On failure the previous list stays in place and a notice is raised.
    /// A cancelled refresh leaves the cache untouched and raises nothing.
    pub async fn refresh<F>(
        &mut self,
        notifier: &dyn Notifier,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<&[T], GradebookError>
    where
        F: Future<Output = Result<Vec<T>, GatewayError>>,
    {
        let items = self.load(notifier, cancel, fetch).await?;
        Ok(self.commit(items))
    }

    /// Runs `fetch` without touching the cached list. Failures are reported
    /// the same way as in [`GradeSource::refresh`]; pass the result to
    /// [`GradeSource::commit`] to publish it.
    pub async fn load<F>(
        &mut self,
        notifier: &dyn Notifier,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Vec<T>, GradebookError>
    where
        F: Future<Output = Result<Vec<T>, GatewayError>>,
    {
        self.loading = true;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetch => Some(result),
        };
        self.loading = false;

        match outcome {
            None => Err(GradebookError::Cancelled),
            Some(Ok(items)) => Ok(items),
            Some(Err(err)) => {
                warn!(source = self.label, error = %err, "grade fetch failed; keeping previous list");
                notifier.notify(Notice::error(
                    format!("Failed to load {}", self.label),
                    err.to_string(),
                ));
                Err(err.into())
            }
        }
    }

    pub fn commit(&mut self, items: Vec<T>) -> &[T] {
        self.items = items;
        self.revision += 1;
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{RecordingNotifier, Severity};

    #[tokio::test]
    async fn failed_refresh_keeps_stale_items() {
        let notifier = RecordingNotifier::new();
        let cancel = CancellationToken::new();
        let mut source = GradeSource::new("assignment grades");

        source
            .refresh(&notifier, &cancel, async { Ok(vec![1, 2, 3]) })
            .await
            .unwrap();
        assert_eq!(source.revision(), 1);

        let err = source
            .refresh(&notifier, &cancel, async {
                Err(GatewayError::Rejected {
                    table: "assignment_grades",
                    message: "offline".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GradebookError::Gateway(_)));
        assert_eq!(source.items(), &[1, 2, 3]);
        assert_eq!(source.revision(), 1);
        assert!(!source.loading());

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].severity, Severity::Error);
        assert_eq!(notices[0].title, "Failed to load assignment grades");
    }

    #[tokio::test]
    async fn cancelled_refresh_does_not_touch_state() {
        let notifier = RecordingNotifier::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source: GradeSource<u8> = GradeSource::new("traditional grades");

        let err = source
            .refresh(&notifier, &cancel, async { Ok(vec![9]) })
            .await
            .unwrap_err();
        assert!(matches!(err, GradebookError::Cancelled));
        assert!(source.items().is_empty());
        assert_eq!(source.revision(), 0);
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn loaded_items_wait_for_commit() {
        let notifier = RecordingNotifier::new();
        let cancel = CancellationToken::new();
        let mut source = GradeSource::new("traditional grades");
        source
            .refresh(&notifier, &cancel, async { Ok(vec!["old"]) })
            .await
            .unwrap();

        let staged = source
            .load(&notifier, &cancel, async { Ok(vec!["new"]) })
            .await
            .unwrap();
        assert_eq!(source.items(), &["old"]);
        assert_eq!(source.revision(), 1);

        source.commit(staged);
        assert_eq!(source.items(), &["new"]);
        assert_eq!(source.revision(), 2);
    }
}
