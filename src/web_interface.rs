use std::time::Instant;

use build_html::Html as _;
use build_html::HtmlContainer as _;
use build_html::Table;
use build_html::{Container, ContainerType, HtmlPage};
use hyper::StatusCode;
use log::debug;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWrite;

use crate::APP_NAME;
use crate::APP_VERSION;
use crate::State;
use crate::error::ProxyCacheError;
use crate::http_util::send_response;
use crate::humanfmt::HumanFmt;
use crate::lifecycle::ADMIN_ORIGIN;
use crate::lifecycle::AdminPage;
use crate::record::RequestRecord;
use crate::record::RequestStatus;

const WEBUI_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[day] [month repr:short] [year] [hour]:[minute]:[second]");

fn format_date(time: OffsetDateTime) -> String {
    time.format(WEBUI_DATE_FORMAT)
        .unwrap_or_else(|_| time.unix_timestamp().to_string())
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Decoded value of the query parameter `name` of `uri`.
fn query_param(uri: &str, name: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| {
            let value = value.replace('+', " ");
            urlencoding::decode(&value).map_or(value.clone(), |v| v.into_owned())
        })
    })
}

fn page(title: &str) -> HtmlPage {
    HtmlPage::new()
        .with_title(format!("{APP_NAME} {title}"))
        .with_header(1, title)
}

fn footer(start: Instant) -> Container {
    Container::new(ContainerType::Footer).with_paragraph(format!(
        "<hr>All dates are in UTC.   --   Generated in {}.",
        HumanFmt::Time(start.elapsed())
    ))
}

fn queue_table(entries: &[RequestRecord]) -> Table {
    let mut table =
        Table::new().with_header_row(&["Item", "URI", "Status", "Size", "Requested", ""]);

    for entry in entries {
        table.add_body_row(&[
            entry.item_id().to_string(),
            escape(entry.uri()),
            entry.status.to_string(),
            HumanFmt::Size(entry.file_size).to_string(),
            format_date(entry.start_time),
            format!(
                "<a href=\"{ADMIN_ORIGIN}/request/queue?remove={}\">remove</a>",
                entry.item_id()
            ),
        ]);
    }

    table
}

fn render_home(state: &State, start: Instant) -> String {
    page("Proxy node")
        .with_container(
            Container::new(ContainerType::Div)
                .with_header(2, "Program Details")
                .with_paragraph(format!(
                    "Version: {}<br>Role: {}<br>Start Time: {}<br>Current Time: {}<br>\
                     Bind Address: {}<br>Bind Port: {}<br>Cache Directory: {}<br>\
                     Queued Requests: {}",
                    APP_VERSION,
                    state.config.role,
                    format_date(state.start_time),
                    format_date(OffsetDateTime::now_utc()),
                    state.config.bind_addr,
                    state.config.bind_port,
                    escape(&state.cache.root().display().to_string()),
                    state.queue.len(),
                ))
                .with_link(format!("{ADMIN_ORIGIN}/request/queue"), "Queue")
                .with_link(format!("{ADMIN_ORIGIN}/request/eta"), "ETA"),
        )
        .with_container(footer(start))
        .to_html_string()
}

fn render_queue(state: &State, uri: &str, start: Instant) -> String {
    let mut details = Container::new(ContainerType::Div);

    if let Some(item_id) = query_param(uri, "remove") {
        let message = if state.queue.remove(&item_id) {
            format!("Removed item {} from the queue.", escape(&item_id))
        } else {
            format!("Item {} is not queued.", escape(&item_id))
        };
        details.add_paragraph(message);
    }

    let entries = state.queue.snapshot();
    details.add_paragraph(format!("{} queued requests:", entries.len()));
    details.add_table(queue_table(&entries));

    page("Request queue")
        .with_container(details)
        .with_container(footer(start))
        .to_html_string()
}

fn render_eta(state: &State, start: Instant) -> String {
    let timeout = state.config.request_timeout();
    let now = OffsetDateTime::now_utc();

    let mut table = Table::new().with_header_row(&["Item", "URI", "Status", "Waiting", "Expires"]);
    let mut open = 0;

    for entry in state.queue.snapshot() {
        if matches!(entry.status, RequestStatus::Completed | RequestStatus::Failed) {
            continue;
        }
        open += 1;

        let waiting = (now - entry.start_time).unsigned_abs();
        let expires = match timeout {
            None => "never".to_string(),
            Some(_) if entry.is_timed_out(timeout) => "expired".to_string(),
            Some(timeout) => format!("in {}", HumanFmt::Time(timeout.saturating_sub(waiting))),
        };

        table.add_body_row(&[
            entry.item_id().to_string(),
            escape(entry.uri()),
            entry.status.to_string(),
            HumanFmt::Time(waiting).to_string(),
            expires,
        ]);
    }

    page("Outstanding requests")
        .with_container(
            Container::new(ContainerType::Div)
                .with_paragraph(format!("{open} requests awaiting fulfillment:"))
                .with_table(table),
        )
        .with_container(footer(start))
        .to_html_string()
}

fn render_search(uri: &str, start: Instant) -> String {
    let terms = query_param(uri, "textfield").unwrap_or_default();

    page("Search")
        .with_container(
            Container::new(ContainerType::Div)
                .with_paragraph(format!("Search for \"{}\" received.", escape(&terms)))
                .with_paragraph("Results are fetched through the proxy like any other page."),
        )
        .with_container(footer(start))
        .to_html_string()
}

/// Page telling the client its request is awaiting fulfillment.
#[must_use]
pub(crate) fn queued_page(record: &RequestRecord, already: bool) -> String {
    let message = if already {
        "is already queued"
    } else {
        "has been queued"
    };

    page("Request queued")
        .with_paragraph(format!("{} {message}.", escape(record.uri())))
        .with_paragraph("Reload this page once it has been fetched.")
        .with_link(format!("{ADMIN_ORIGIN}/request/queue"), "View the queue")
        .to_html_string()
}

pub(crate) async fn serve_admin<W>(
    state: &State,
    admin_page: AdminPage,
    uri: &str,
    client: &mut W,
) -> Result<(), ProxyCacheError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    debug!("Requested admin page {admin_page:?} via `{uri}`");
    let start = Instant::now();

    let html = match admin_page {
        AdminPage::Home => render_home(state, start),
        AdminPage::Queue => render_queue(state, uri, start),
        AdminPage::Eta => render_eta(state, start),
        AdminPage::Search => render_search(uri, start),
    };

    send_response(client, StatusCode::OK, "text/html", html.as_bytes()).await?;
    Ok(())
}
