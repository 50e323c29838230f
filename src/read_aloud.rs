//! Read-aloud word highlighting.
//!
//! The highlight advances on a fixed schedule estimated from the text
//! length. It is not synchronised with the speech audio and drifts from the
//! spoken word boundaries, especially for long words.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GradebookError;
use crate::models::WordToken;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid word regex"));

pub const DEFAULT_MS_PER_CHAR: u64 = 60;

pub fn tokenize(text: &str) -> Vec<WordToken> {
    WORD_RE
        .find_iter(text)
        .enumerate()
        .map(|(index, m)| WordToken {
            word: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
            index,
        })
        .collect()
}

/// Decides how long each word stays highlighted.
pub trait TimingEstimator: Send + Sync {
    /// `None` when there is nothing to read.
    fn word_interval(
        &self,
        text: &str,
        token_count: usize,
        speed: f64,
    ) -> Result<Option<Duration>, GradebookError>;
}

/// Fixed cost per character spread evenly over the words.
#[derive(Debug, Clone, Copy)]
pub struct LinearEstimator {
    pub per_char: Duration,
}

impl Default for LinearEstimator {
    fn default() -> Self {
        Self {
            per_char: Duration::from_millis(DEFAULT_MS_PER_CHAR),
        }
    }
}

impl TimingEstimator for LinearEstimator {
    fn word_interval(
        &self,
        text: &str,
        token_count: usize,
        speed: f64,
    ) -> Result<Option<Duration>, GradebookError> {
        if !speed.is_finite() || speed <= 0.0 {
            return Err(GradebookError::InvalidSpeed(speed));
        }
        if token_count == 0 {
            return Ok(None);
        }
        let total_nanos = text.chars().count() as f64 * self.per_char.as_nanos() as f64;
        let per_word = total_nanos / token_count as f64 / speed;
        // tokio intervals reject a zero period
        Ok(Some(Duration::from_nanos(per_word.round() as u64).max(Duration::from_millis(1))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightEvent {
    pub index: usize,
    /// Offset from the start of playback.
    pub at: Duration,
}

pub fn highlight_schedule(
    tokens: &[WordToken],
    interval: Duration,
) -> impl Iterator<Item = HighlightEvent> + '_ {
    tokens.iter().map(move |token| HighlightEvent {
        index: token.index,
        at: interval.saturating_mul(u32::try_from(token.index).unwrap_or(u32::MAX)),
    })
}

/// Drives the current-word index for one piece of text at a time.
pub struct ReadAloud {
    estimator: Box<dyn TimingEstimator>,
    tokens: Vec<WordToken>,
    current: Arc<watch::Sender<Option<usize>>>,
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl Default for ReadAloud {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadAloud {
    pub fn new() -> Self {
        Self::with_estimator(Box::new(LinearEstimator::default()))
    }

    pub fn with_estimator(estimator: Box<dyn TimingEstimator>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            estimator,
            tokens: Vec::new(),
            current: Arc::new(current),
            cancel: CancellationToken::new(),
            ticker: None,
        }
    }

    pub fn tokens(&self) -> &[WordToken] {
        &self.tokens
    }

    pub fn current(&self) -> Option<usize> {
        *self.current.borrow()
    }

    pub fn current_word(&self) -> Option<&WordToken> {
        self.current().and_then(|i| self.tokens.get(i))
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<usize>> {
        self.current.subscribe()
    }

    /// Replaces the text and starts highlighting from the first word.
    ///
    /// Must be called inside a tokio runtime. Returns the per-word interval,
    /// or `None` when the text has no words.
    pub fn start(&mut self, text: &str, speed: f64) -> Result<Option<Duration>, GradebookError> {
        let tokens = tokenize(text);
        let interval = self.estimator.word_interval(text, tokens.len(), speed)?;

        self.stop();
        self.tokens = tokens;
        let Some(interval) = interval else {
            return Ok(None);
        };

        debug!(words = self.tokens.len(), ?interval, speed, "read-aloud started");
        self.current.send_replace(Some(0));
        self.cancel = CancellationToken::new();
        self.ticker = Some(tokio::spawn(advance(
            Arc::clone(&self.current),
            self.tokens.len(),
            interval,
            self.cancel.clone(),
        )));
        Ok(Some(interval))
    }

    /// Stops the timer and clears the highlight immediately.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.current.send_replace(None);
    }
}

impl Drop for ReadAloud {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

async fn advance(
    current: Arc<watch::Sender<Option<usize>>>,
    count: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut finished = false;
        // The cancellation check runs under the channel lock so a concurrent
        // stop() always has the last word.
        current.send_if_modified(|index| {
            if cancel.is_cancelled() {
                finished = true;
                return false;
            }
            let next = index.map(|i| i + 1).filter(|&i| i < count);
            finished = next.is_none();
            *index = next;
            true
        });
        if finished {
            return;
        }
    }
}
