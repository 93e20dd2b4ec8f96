//! Just enough XML for queue message envelopes. The service responses are
//! flat and never use attributes or CDATA on the elements read here.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueMessage {
    pub message_id: String,
    pub pop_receipt: String,
    pub message_text: Option<String>,
}

/// `<QueueMessage><MessageText>…</MessageText></QueueMessage>` request body.
pub(crate) fn put_message_body(text: &str) -> String {
    format!(
        "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
        escape(text)
    )
}

/// Messages in a `QueueMessagesList` response.
pub(crate) fn parse_messages(xml: &str) -> Vec<QueueMessage> {
    elements(xml, "QueueMessage")
        .into_iter()
        .filter_map(|item| {
            Some(QueueMessage {
                message_id: unescape(element(item, "MessageId")?),
                pop_receipt: unescape(element(item, "PopReceipt")?),
                message_text: element(item, "MessageText").map(unescape),
            })
        })
        .collect()
}

/// Inner text of the first `<tag>` element.
pub(crate) fn element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    elements(xml, tag).into_iter().next()
}

fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after_open = &rest[start + open.len()..];
        let Some(end) = after_open.find(&close) else {
            break;
        };
        found.push(&after_open[..end]);
        rest = &after_open[end + close.len()..];
    }
    found
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
