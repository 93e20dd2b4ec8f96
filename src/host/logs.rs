use std::sync::Arc;
use tokio::sync::RwLock;

/// Append-only buffer of lines captured from the function host.
///
/// [`LogBuffer::new`] hands out the single [`LogSink`] that appends and a
/// [`LogView`] that any number of probes can clone and read.
pub struct LogBuffer;

impl LogBuffer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (LogSink, LogView) {
        let lines = Arc::new(RwLock::new(Vec::new()));
        (
            LogSink {
                lines: lines.clone(),
            },
            LogView { lines },
        )
    }
}

/// Write half. Not `Clone`: only one producer owns the accumulation.
pub struct LogSink {
    lines: Arc<RwLock<Vec<String>>>,
}

impl LogSink {
    pub async fn push(&self, line: impl Into<String>) {
        self.lines.write().await.push(line.into());
    }

    pub fn view(&self) -> LogView {
        LogView {
            lines: self.lines.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LogView {
    lines: Arc<RwLock<Vec<String>>>,
}

impl LogView {
    pub async fn contains(&self, needle: &str) -> bool {
        self.lines
            .read()
            .await
            .iter()
            .any(|line| line.contains(needle))
    }

    /// True when a single line contains every needle.
    pub async fn contains_all(&self, needles: &[&str]) -> bool {
        self.lines
            .read()
            .await
            .iter()
            .any(|line| needles.iter().all(|needle| line.contains(needle)))
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.lines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Lines appended after the first `offset` lines.
    pub async fn lines_since(&self, offset: usize) -> Vec<String> {
        let lines = self.lines.read().await;
        lines.get(offset..).map(<[String]>::to_vec).unwrap_or_default()
    }

    /// Last `count` lines joined for failure messages.
    pub async fn tail(&self, count: usize) -> String {
        let lines = self.lines.read().await;
        let start = lines.len().saturating_sub(count);
        lines[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn views_see_sink_appends() {
        let (sink, view) = LogBuffer::new();
        let other = sink.view();
        assert!(view.is_empty().await);

        sink.push("Host started").await;
        sink.push("Executed 'Functions.QueueTrigger' (Succeeded, Id=1)").await;

        assert!(view.contains("Host started").await);
        assert!(other.contains_all(&["Executed", "Succeeded"]).await);
        assert!(!view.contains_all(&["Host started", "Succeeded"]).await);
        assert_eq!(other.len().await, 2);
    }

    #[tokio::test]
    async fn lines_since_and_tail() {
        let (sink, view) = LogBuffer::new();
        for i in 0..5 {
            sink.push(format!("line {i}")).await;
        }
        assert_eq!(view.lines_since(3).await, vec!["line 3", "line 4"]);
        assert!(view.lines_since(10).await.is_empty());
        assert_eq!(view.tail(2).await, "line 3\nline 4");
        assert_eq!(view.tail(100).await.lines().count(), 5);
        assert_eq!(view.snapshot().await.len(), 5);
    }
}
