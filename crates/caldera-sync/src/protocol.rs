//! # CalDAV Wire Bodies
//!
//! Request bodies for PROPFIND / REPORT and the multistatus parser.
//!
//! ## Request Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CalDAV Request Bodies                            │
//! │                                                                         │
//! │  DISCOVERY (PROPFIND)                                                  │
//! │  ────────────────────                                                  │
//! │  base URL      Depth: 0 ──► current-user-principal                     │
//! │  principal     Depth: 0 ──► calendar-home-set                          │
//! │  home set      Depth: 1 ──► displayname, resourcetype, getctag,        │
//! │                             sync-token, calendar-color                 │
//! │                                                                         │
//! │  DELTA (REPORT)                                                        │
//! │  ──────────────                                                        │
//! │  collection    sync-collection { sync-token } ──► changed hrefs + etag │
//! │                                                    404 = removed       │
//! │  collection    calendar-query (fallback)     ──► every href + etag     │
//! │  collection    calendar-multiget { hrefs }   ──► calendar-data         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Parsing
//! Elements are matched by local name. Servers disagree on prefixes and a
//! few put CalendarServer extensions (`getctag`) in odd namespaces, so the
//! namespace is not checked.

use roxmltree::{Document, Node};

use crate::error::{SyncError, SyncResult};

/// WebDAV namespace.
pub const DAV_NS: &str = "DAV:";

/// CalDAV namespace (RFC 4791).
pub const CALDAV_NS: &str = "urn:ietf:params:xml:ns:caldav";

// =============================================================================
// Request Bodies
// =============================================================================

/// PROPFIND for the principal URL.
pub fn current_user_principal_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:current-user-principal/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

/// PROPFIND for the calendar home collection.
pub fn calendar_home_set_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <c:calendar-home-set/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

/// PROPFIND listing collections and their sync state.
pub fn list_calendars_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:ical="http://apple.com/ns/ical/">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
    <d:sync-token/>
    <cs:getctag/>
    <ical:calendar-color/>
    <c:supported-calendar-component-set/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

/// PROPFIND for a single collection's `getctag` and `sync-token`.
pub fn collection_state_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/">
  <d:prop>
    <d:sync-token/>
    <cs:getctag/>
  </d:prop>
</d:propfind>"#
        .to_string()
}

/// RFC 6578 sync-collection report.
///
/// ## Arguments
/// * `sync_token` - Token from the previous pass; `None` lists everything
pub fn sync_collection_body(sync_token: Option<&str>) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<d:sync-collection xmlns:d="DAV:">
  <d:sync-token>{}</d:sync-token>
  <d:sync-level>1</d:sync-level>
  <d:prop>
    <d:getetag/>
  </d:prop>
</d:sync-collection>"#,
        escape(sync_token.unwrap_or_default())
    )
}

/// calendar-query listing every VEVENT resource's href and ETag.
pub fn calendar_query_body() -> String {
    r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT"/>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#
        .to_string()
}

/// calendar-multiget fetching bodies for a batch of hrefs.
pub fn calendar_multiget_body<'a>(hrefs: impl IntoIterator<Item = &'a str>) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="utf-8"?>
<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
"#,
    );
    for href in hrefs {
        body.push_str("  <d:href>");
        body.push_str(&escape(href));
        body.push_str("</d:href>\n");
    }
    body.push_str("</c:calendar-multiget>");
    body
}

/// Escapes text content for inclusion in an XML body.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// =============================================================================
// Multistatus Parsing
// =============================================================================

/// One `<response>` of a multistatus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResponse {
    /// Raw href as sent by the server (usually an absolute path).
    pub href: String,
    /// Response-level status (sync-collection reports removals as 404).
    pub status: Option<u16>,
    pub etag: Option<String>,
    pub calendar_data: Option<String>,
    pub display_name: Option<String>,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    pub color: Option<String>,
    /// `resourcetype` contains `calendar`.
    pub is_calendar: bool,
    /// `supported-calendar-component-set` lists VEVENT (or is absent).
    pub supports_events: bool,
    /// href inside `current-user-principal`.
    pub principal: Option<String>,
    /// href inside `calendar-home-set`.
    pub calendar_home: Option<String>,
}

impl DavResponse {
    /// Returns true if the server says this member is gone.
    pub fn is_removed(&self) -> bool {
        matches!(self.status, Some(404) | Some(410))
    }
}

/// Parsed `<multistatus>` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multistatus {
    pub responses: Vec<DavResponse>,
    /// Top-level `sync-token` of a sync-collection report.
    pub sync_token: Option<String>,
}

/// Parses a 207 body.
///
/// Properties are only read from `propstat` blocks whose status is 2xx.
pub fn parse_multistatus(body: &str) -> SyncResult<Multistatus> {
    let doc = Document::parse(body)?;
    let root = doc.root_element();
    if root.tag_name().name() != "multistatus" {
        return Err(SyncError::InvalidResponse(format!(
            "expected multistatus, found <{}>",
            root.tag_name().name()
        )));
    }

    let mut multistatus = Multistatus::default();

    for child in root.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "response" => {
                if let Some(response) = parse_response(child) {
                    multistatus.responses.push(response);
                }
            }
            "sync-token" => multistatus.sync_token = text_of(child),
            _ => {}
        }
    }

    Ok(multistatus)
}

fn parse_response(node: Node<'_, '_>) -> Option<DavResponse> {
    let href = node
        .children()
        .find(|n| n.tag_name().name() == "href")
        .and_then(text_of)?;

    let mut response = DavResponse {
        href,
        supports_events: true,
        ..DavResponse::default()
    };

    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "status" => response.status = child.text().and_then(parse_status_line),
            "propstat" => {
                let ok = child
                    .children()
                    .find(|n| n.tag_name().name() == "status")
                    .and_then(|n| n.text())
                    .and_then(parse_status_line)
                    .map(|code| (200..300).contains(&code))
                    .unwrap_or(true);
                if !ok {
                    continue;
                }
                if let Some(prop) = child.children().find(|n| n.tag_name().name() == "prop") {
                    read_props(prop, &mut response);
                }
            }
            _ => {}
        }
    }

    Some(response)
}

fn read_props(prop: Node<'_, '_>, response: &mut DavResponse) {
    for property in prop.children().filter(Node::is_element) {
        match property.tag_name().name() {
            "getetag" => response.etag = text_of(property),
            "calendar-data" => response.calendar_data = raw_text(property),
            "displayname" => response.display_name = text_of(property),
            "getctag" => response.ctag = text_of(property),
            "sync-token" => response.sync_token = text_of(property),
            "calendar-color" => response.color = text_of(property).map(|c| normalize_color(&c)),
            "resourcetype" => {
                response.is_calendar = property
                    .children()
                    .any(|n| n.is_element() && n.tag_name().name() == "calendar");
            }
            "supported-calendar-component-set" => {
                let comps: Vec<&str> = property
                    .children()
                    .filter(|n| n.tag_name().name() == "comp")
                    .filter_map(|n| n.attribute("name"))
                    .collect();
                response.supports_events =
                    comps.is_empty() || comps.iter().any(|c| c.eq_ignore_ascii_case("VEVENT"));
            }
            "current-user-principal" => response.principal = nested_href(property),
            "calendar-home-set" => response.calendar_home = nested_href(property),
            _ => {}
        }
    }
}

fn nested_href(node: Node<'_, '_>) -> Option<String> {
    node.descendants()
        .find(|n| n.tag_name().name() == "href")
        .and_then(text_of)
}

/// Trimmed text of an element, `None` when empty.
fn text_of(node: Node<'_, '_>) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Untrimmed text (iCalendar bodies keep their line structure).
fn raw_text(node: Node<'_, '_>) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// `HTTP/1.1 404 Not Found` → 404.
pub fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Apple clients store `#RRGGBBAA`; the alpha byte is dropped.
fn normalize_color(color: &str) -> String {
    if color.starts_with('#') && color.len() == 9 {
        color[..7].to_string()
    } else {
        color.to_string()
    }
}

/// Returns true if an error body carries the `valid-sync-token` precondition.
pub fn is_invalid_sync_token(body: &str) -> bool {
    match Document::parse(body) {
        Ok(doc) => doc
            .descendants()
            .any(|n| n.tag_name().name() == "valid-sync-token"),
        Err(_) => body.contains("valid-sync-token"),
    }
}

/// Returns true if a `DAV` response header advertises CalDAV.
pub fn advertises_calendar_access<'a>(values: impl IntoIterator<Item = &'a str>) -> bool {
    values
        .into_iter()
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("calendar-access"))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SYNC_REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/cal/work/a.ics</d:href>
    <d:propstat>
      <d:prop><d:getetag>"e1"</d:getetag></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/cal/work/gone.ics</d:href>
    <d:status>HTTP/1.1 404 Not Found</d:status>
  </d:response>
  <d:sync-token>http://example.com/sync/42</d:sync-token>
</d:multistatus>"#;

    #[test]
    fn test_parse_sync_collection() {
        let ms = parse_multistatus(SYNC_REPORT).unwrap();
        assert_eq!(ms.sync_token.as_deref(), Some("http://example.com/sync/42"));
        assert_eq!(ms.responses.len(), 2);

        let changed = &ms.responses[0];
        assert_eq!(changed.href, "/cal/work/a.ics");
        assert_eq!(changed.etag.as_deref(), Some("\"e1\""));
        assert!(!changed.is_removed());

        assert!(ms.responses[1].is_removed());
    }

    #[test]
    fn test_parse_calendar_listing() {
        let body = r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav"
            xmlns:CS="http://calendarserver.org/ns/" xmlns:A="http://apple.com/ns/ical/">
  <response>
    <href>/cal/</href>
    <propstat>
      <prop><resourcetype><collection/></resourcetype><displayname>Home</displayname></prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
  <response>
    <href>/cal/work/</href>
    <propstat>
      <prop>
        <resourcetype><collection/><C:calendar/></resourcetype>
        <displayname>Work</displayname>
        <CS:getctag>ctag-1</CS:getctag>
        <sync-token>tok-1</sync-token>
        <A:calendar-color>#FF0000FF</A:calendar-color>
        <C:supported-calendar-component-set><C:comp name="VEVENT"/></C:supported-calendar-component-set>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
    <propstat>
      <prop><getetag>ignored</getetag></prop>
      <status>HTTP/1.1 404 Not Found</status>
    </propstat>
  </response>
  <response>
    <href>/cal/tasks/</href>
    <propstat>
      <prop>
        <resourcetype><collection/><C:calendar/></resourcetype>
        <C:supported-calendar-component-set><C:comp name="VTODO"/></C:supported-calendar-component-set>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#;
        let ms = parse_multistatus(body).unwrap();
        assert!(!ms.responses[0].is_calendar);

        let work = &ms.responses[1];
        assert!(work.is_calendar);
        assert!(work.supports_events);
        assert_eq!(work.display_name.as_deref(), Some("Work"));
        assert_eq!(work.ctag.as_deref(), Some("ctag-1"));
        assert_eq!(work.sync_token.as_deref(), Some("tok-1"));
        assert_eq!(work.color.as_deref(), Some("#FF0000"));
        assert_eq!(work.etag, None);

        assert!(!ms.responses[2].supports_events);
    }

    #[test]
    fn test_parse_principal_and_home() {
        let body = r#"<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response>
    <d:href>/</d:href>
    <d:propstat>
      <d:prop>
        <d:current-user-principal><d:href>/principals/alice/</d:href></d:current-user-principal>
        <c:calendar-home-set><d:href>/cal/alice/</d:href></c:calendar-home-set>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;
        let ms = parse_multistatus(body).unwrap();
        assert_eq!(ms.responses[0].principal.as_deref(), Some("/principals/alice/"));
        assert_eq!(ms.responses[0].calendar_home.as_deref(), Some("/cal/alice/"));
    }

    #[test]
    fn test_calendar_data_keeps_lines() {
        let body = "<d:multistatus xmlns:d=\"DAV:\" xmlns:c=\"urn:ietf:params:xml:ns:caldav\">\
            <d:response><d:href>/a.ics</d:href><d:propstat><d:prop>\
            <c:calendar-data>BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n</c:calendar-data>\
            </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>\
            </d:multistatus>";
        let ms = parse_multistatus(body).unwrap();
        let data = ms.responses[0].calendar_data.as_deref().unwrap();
        assert!(data.starts_with("BEGIN:VCALENDAR"));
        assert!(data.contains("END:VCALENDAR"));
    }

    #[test]
    fn test_rejects_non_multistatus() {
        assert!(matches!(
            parse_multistatus("<html/>"),
            Err(SyncError::InvalidResponse(_))
        ));
        assert!(parse_multistatus("not xml").is_err());
    }

    #[test]
    fn test_headers_and_errors() {
        assert!(advertises_calendar_access(["1, 2, access-control", "calendar-access"]));
        assert!(!advertises_calendar_access(["1, 2, 3"]));
        assert!(is_invalid_sync_token(
            r#"<d:error xmlns:d="DAV:"><d:valid-sync-token/></d:error>"#
        ));
        assert!(!is_invalid_sync_token(r#"<d:error xmlns:d="DAV:"/>"#));
        assert_eq!(parse_status_line("HTTP/1.1 207 Multi-Status"), Some(207));
    }

    #[test]
    fn test_bodies_escape_input() {
        let body = sync_collection_body(Some("a&b"));
        assert!(body.contains("<d:sync-token>a&amp;b</d:sync-token>"));
        assert!(sync_collection_body(None).contains("<d:sync-token></d:sync-token>"));

        let multiget = calendar_multiget_body(["/a.ics", "/b.ics"]);
        assert!(multiget.contains("<d:href>/a.ics</d:href>"));
        assert!(multiget.contains("<d:href>/b.ics</d:href>"));
    }
}
