use std::cell::RefCell;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::debug;

use super::{functions, unique, Harness, ScenarioError, LOG_TAIL_LINES};
use crate::poll::{wait_for_cancellable, wait_until_cancellable};

pub(super) async fn queue_trigger(h: &Harness) -> Result<(), ScenarioError> {
    let message = unique("queue");
    let id = h.seed_message(&h.resources.input_queue, &message).await?;
    debug!(%id, queue = %h.resources.input_queue, "seeded queue trigger");

    h.expect_message(&h.resources.output_queue, &message).await
}

pub(super) async fn queue_trigger_logs(h: &Harness) -> Result<(), ScenarioError> {
    let message = unique("logged");
    let offset = h.logs.len().await;
    h.seed_message(&h.resources.input_queue, &message).await?;

    let logs = &h.logs;
    let seen: RefCell<Vec<String>> = RefCell::new(Vec::new());
    wait_until_cancellable(
        &h.policy,
        &h.cancel,
        || async {
            let lines = logs.lines_since(offset).await;
            let done = invocation_succeeded(&lines, functions::QUEUE_TRIGGER, &message);
            *seen.borrow_mut() = lines;
            done
        },
        || {
            let seen = seen.borrow();
            let tail = &seen[seen.len().saturating_sub(LOG_TAIL_LINES)..];
            format!(
                "host log line '{}' followed by '{}' for the same invocation; output since seeding:\n{}",
                message,
                functions::executed_line(functions::QUEUE_TRIGGER),
                tail.join("\n")
            )
        },
    )
    .await?;

    // The invocation also wrote to the output queue; consume it so the next
    // scenario starts clean.
    h.expect_message(&h.resources.output_queue, &message).await
}

/// True when the invocation that logged `marker` finished with a success
/// line. The invocation is the nearest `Executing` line before the marker;
/// when the host logs none, any later success line of `function` counts.
fn invocation_succeeded(lines: &[String], function: &str, marker: &str) -> bool {
    let Some(at) = lines.iter().position(|line| line.contains(marker)) else {
        return false;
    };
    let executing = format!("Executing 'Functions.{function}'");
    let succeeded = functions::executed_line(function);
    let id = lines[..at]
        .iter()
        .rev()
        .find(|line| line.contains(&executing))
        .and_then(|line| invocation_id(line));

    lines[at..].iter().any(|line| {
        line.contains(&succeeded) && id.map_or(true, |id| invocation_id(line) == Some(id))
    })
}

/// `abc` from `... (Reason='...', Id=abc)` or `... (Succeeded, Id=abc, Duration=3ms)`.
fn invocation_id(line: &str) -> Option<&str> {
    let start = line.rfind(" Id=")? + " Id=".len();
    let rest = &line[start..];
    let end = rest.find(|c| c == ',' || c == ')').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Two inputs, two outputs of the form `{input}|{tag}` with tag `1` or `2`,
/// in any order.
pub(super) async fn queue_pair(h: &Harness) -> Result<(), ScenarioError> {
    let inputs = [unique("pair-a"), unique("pair-b")];
    for input in &inputs {
        h.seed_message(&h.resources.pair_input_queue, input).await?;
    }

    let queue = h.resources.pair_output_queue.as_str();
    let storage = h.storage.as_ref();
    let collected = Mutex::new(Vec::new());
    let (outputs, _) = wait_for_cancellable(
        &h.policy,
        &h.cancel,
        || async {
            let mut collected = collected.lock().await;
            match storage.read_all_messages(queue).await {
                Ok(batch) => collected.extend(batch),
                Err(e) => debug!(queue, error = %e, "pair output read failed, retrying"),
            }
            (collected.len() >= inputs.len()).then(|| collected.clone())
        },
        || {
            format!(
                "{} tagged messages on queue '{}'",
                inputs.len(),
                queue
            )
        },
    )
    .await?;

    check_pairs(&inputs, &outputs)
}

fn check_pairs(inputs: &[String], outputs: &[String]) -> Result<(), ScenarioError> {
    if outputs.len() != inputs.len() {
        return Err(ScenarioError::mismatch(
            "pair output count",
            inputs.len().to_string(),
            outputs.len().to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for output in outputs {
        let Some((payload, tag)) = output.rsplit_once('|') else {
            return Err(ScenarioError::mismatch(
                "pair output format",
                "{input}|{tag}",
                output.as_str(),
            ));
        };
        if tag != "1" && tag != "2" {
            return Err(ScenarioError::mismatch(
                format!("tag of '{}'", output),
                "1 or 2",
                tag,
            ));
        }
        if !inputs.iter().any(|input| input == payload) {
            return Err(ScenarioError::mismatch(
                "pair output payload",
                inputs.join(" or "),
                payload,
            ));
        }
        if !seen.insert(payload) {
            return Err(ScenarioError::mismatch(
                "pair outputs",
                "one output per input",
                format!("'{}' twice", payload),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn invocation(id: u32, message: &str, outcome: &str) -> Vec<String> {
        vec![
            format!(
                "Executing 'Functions.QueueTriggerAndOutput' (Reason='New queue message', Id={id})"
            ),
            format!("Queue trigger processed: {message}"),
            format!(
                "Executed 'Functions.QueueTriggerAndOutput' ({outcome}, Id={id}, Duration=2ms)"
            ),
        ]
    }

    #[test]
    fn success_line_must_belong_to_the_invocation() {
        let mut lines = invocation(1, "first", "Succeeded");
        lines.extend(invocation(2, "second", "Failed"));
        assert!(invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "first"));
        assert!(!invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "second"));

        lines.extend(invocation(12, "third", "Succeeded"));
        assert!(!invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "second"));
        assert!(invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "third"));
    }

    #[test]
    fn success_before_the_marker_does_not_count() {
        let lines = strings(&[
            "Executed 'Functions.QueueTriggerAndOutput' (Succeeded, Id=7, Duration=1ms)",
            "Queue trigger processed: late",
        ]);
        assert!(!invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "late"));
        assert!(!invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "absent"));
    }

    #[test]
    fn without_executing_line_any_later_success_counts() {
        let lines = strings(&[
            "Queue trigger processed: bare",
            "Executed 'Functions.QueueTriggerAndOutput' (Succeeded, Id=9, Duration=1ms)",
        ]);
        assert!(invocation_succeeded(&lines, functions::QUEUE_TRIGGER, "bare"));
    }

    #[test]
    fn reads_invocation_ids() {
        assert_eq!(
            invocation_id("Executing 'Functions.F' (Reason='x', Id=abc-1)"),
            Some("abc-1")
        );
        assert_eq!(
            invocation_id("Executed 'Functions.F' (Succeeded, Id=42, Duration=3ms)"),
            Some("42")
        );
        assert_eq!(invocation_id("no id here"), None);
    }

    #[test]
    fn pairs_accept_any_order_and_tag() {
        let inputs = strings(&["a", "b"]);
        assert!(check_pairs(&inputs, &strings(&["b|1", "a|2"])).is_ok());
        assert!(check_pairs(&inputs, &strings(&["a|1", "b|1"])).is_ok());
    }

    #[test]
    fn payloads_may_contain_separator() {
        let inputs = strings(&["x|y", "z"]);
        assert!(check_pairs(&inputs, &strings(&["x|y|2", "z|1"])).is_ok());
    }

    #[test]
    fn pairs_reject_bad_outputs() {
        let inputs = strings(&["a", "b"]);
        assert!(check_pairs(&inputs, &strings(&["a|1"])).is_err());
        assert!(check_pairs(&inputs, &strings(&["a|3", "b|1"])).is_err());
        assert!(check_pairs(&inputs, &strings(&["a|1", "c|2"])).is_err());
        assert!(check_pairs(&inputs, &strings(&["a|1", "a|2"])).is_err());
        assert!(check_pairs(&inputs, &strings(&["a", "b|2"])).is_err());
    }
}
