use super::{functions, unique, Harness, ScenarioError};
use crate::invoke::HttpResponse;
use crate::poll::retry::with_retry;

/// Invoke `route` and require `status` and a body containing `body_contains`.
pub async fn invoke_expecting(
    h: &Harness,
    route: &str,
    query: &str,
    status: u16,
    body_contains: &str,
) -> Result<HttpResponse, ScenarioError> {
    let invoker = &h.invoker;
    let response = with_retry(&h.retry, "invoke", || invoker.invoke(route, query)).await?;

    if response.status != status {
        return Err(ScenarioError::mismatch(
            format!("status of {}", invoker.url(route, query)),
            status.to_string(),
            format!("{} ({})", response.status, response.body),
        ));
    }
    if !response.body.contains(body_contains) {
        return Err(ScenarioError::mismatch(
            format!("body of {}", invoker.url(route, query)),
            format!("text containing '{}'", body_contains),
            response.body,
        ));
    }
    Ok(response)
}

pub(super) async fn http_trigger(h: &Harness) -> Result<(), ScenarioError> {
    let name = unique("http");
    invoke_expecting(
        h,
        functions::HTTP_TRIGGER,
        &format!("name={}", urlencoding::encode(&name)),
        200,
        &name,
    )
    .await?;

    invoke_expecting(h, functions::HTTP_TRIGGER, "", 400, "").await?;
    Ok(())
}

pub(super) async fn http_trigger_queue_output(h: &Harness) -> Result<(), ScenarioError> {
    let name = unique("http-queue");
    invoke_expecting(
        h,
        functions::HTTP_QUEUE_OUTPUT,
        &format!("name={}", urlencoding::encode(&name)),
        200,
        "",
    )
    .await?;

    h.expect_message(&h.resources.http_output_queue, &name).await
}
