use std::str::Split;

use crate::blacklist::Blacklist;
use crate::cache_store::CacheStore;
use crate::http_util::is_valid_uri;
use crate::http_util::uri_host;
use crate::record::RequestRecord;

const CITE_OPEN: &str = "<cite>";
const CITE_CLOSE: &str = "</cite>";
const ANCHOR_OPEN: &str = "<a href=";
const ANCHOR_CLOSE: &str = "</a>";
const TITLE_SEPARATOR: &str = " - ";

/// Result links of a search result page, in page order.
///
/// Each result is a cited URI preceded by the anchor carrying its title. The
/// page is scanned lazily, one citation per step, and the iterator cannot be
/// restarted.
pub(crate) struct ResultLinks<'a> {
    segments: Split<'a, &'static str>,
    previous: Option<&'a str>,
    cache: &'a CacheStore,
    blacklist: &'a Blacklist,
    referer: &'a str,
}

impl<'a> ResultLinks<'a> {
    #[must_use]
    pub(crate) fn new(
        page: &'a str,
        cache: &'a CacheStore,
        blacklist: &'a Blacklist,
        referer: &'a str,
    ) -> Self {
        let mut links = Self {
            segments: page.split(CITE_OPEN),
            previous: None,
            cache,
            blacklist,
            referer,
        };
        links.previous = links.next_segment();
        links
    }

    fn next_segment(&mut self) -> Option<&'a str> {
        self.segments.find(|segment| !segment.is_empty())
    }

    fn link(&self, before: &str, cited: &str) -> Option<RequestRecord> {
        let title = anchor_title(before)?;
        let uri = cited_uri(cited)?;

        if !is_valid_uri(&uri)
            || self.blacklist.is_blacklisted(&uri)
            || !uri_host(&uri).is_some_and(|host| host.contains('.'))
        {
            return None;
        }

        Some(RequestRecord::new(self.cache, &uri, &title, self.referer))
    }
}

impl Iterator for ResultLinks<'_> {
    type Item = RequestRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let current = self.next_segment()?;
            let before = self.previous.replace(current)?;

            if let Some(record) = self.link(before, current) {
                return Some(record);
            }
        }
    }
}

/// Text of the last anchor in `segment`.
fn anchor_title(segment: &str) -> Option<String> {
    let anchor = &segment[segment.rfind(ANCHOR_OPEN)?..];
    let text = &anchor[anchor.find('>')? + 1..];
    let text = text.find(ANCHOR_CLOSE).map_or(text, |end| &text[..end]);

    Some(strip_tags(text).trim().to_string()).filter(|title| !title.is_empty())
}

/// The cited URI at the start of `segment`, made absolute.
fn cited_uri(segment: &str) -> Option<String> {
    let cited = match segment.find(CITE_CLOSE) {
        Some(end) if end > 0 => &segment[..end],
        _ => return None,
    };
    let cited = cited.find(TITLE_SEPARATOR).map_or(cited, |end| &cited[..end]);

    let uri = strip_tags(cited);
    let uri = uri.trim();
    if uri.is_empty() {
        return None;
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        Some(uri.to_string())
    } else {
        Some(format!("http://{uri}"))
    }
}

/// Drops every `<...>` tag, keeping the text between them.
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::ConfigDomainName;

    const SEARCH: &str = "http://www.google.com/search?q=water";

    const PAGE: &str = concat!(
        "<html><body><h3><a href=\"http://www.water.org/\">Clean <b>water</b> for all</a></h3>",
        "<cite>www.water.org/</cite><div>",
        "<h3><a href=\"http://ads.spam.com/\">Buy now</a></h3>",
        "<cite>ads.spam.com/offer - 12k</cite>",
        "<h3><a href=\"http://localhost/\">Local</a></h3>",
        "<cite>localhost/</cite>",
        "<h3><a href=\"http://wells.example.org/guide\"></a></h3>",
        "<cite>wells.example.org/guide</cite>",
        "<h3><a href=\"http://pumps.example.net/\">Hand <em>pumps</em></a></h3>",
        "<cite><b>pumps</b>.example.net/manual.html - 34k - Cached</cite></body></html>",
    );

    fn cache() -> CacheStore {
        CacheStore::new(PathBuf::from("/srv/cache"))
    }

    #[test]
    fn extracts_valid_links() {
        let cache = cache();
        let spam = ConfigDomainName::new("*.spam.com".to_string()).unwrap();
        let blacklist = Blacklist::new(vec![spam]);

        let links: Vec<RequestRecord> =
            ResultLinks::new(PAGE, &cache, &blacklist, SEARCH).collect();

        let found: Vec<(&str, &str)> = links
            .iter()
            .map(|link| (link.uri(), link.anchor_text.as_str()))
            .collect();
        assert_eq!(
            found,
            [
                ("http://www.water.org/", "Clean water for all"),
                ("http://pumps.example.net/manual.html", "Hand pumps"),
            ]
        );
        assert!(links.iter().all(|link| link.referer_uri == SEARCH));
    }

    #[test]
    fn is_lazy() {
        let cache = cache();
        let blacklist = Blacklist::default();

        let mut links = ResultLinks::new(PAGE, &cache, &blacklist, "");
        let mut next_uri = || links.next().map(|link| link.uri().to_string());
        assert_eq!(next_uri().as_deref(), Some("http://www.water.org/"));
        assert_eq!(next_uri().as_deref(), Some("http://ads.spam.com/offer"));

        assert_eq!(ResultLinks::new(PAGE, &cache, &blacklist, "").take(1).count(), 1);
    }

    #[test]
    fn pages_without_results() {
        let cache = cache();
        let blacklist = Blacklist::default();

        assert_eq!(ResultLinks::new("", &cache, &blacklist, "").count(), 0);
        assert_eq!(ResultLinks::new("<html>nothing</html>", &cache, &blacklist, "").count(), 0);
        assert_eq!(ResultLinks::new("<cite></cite><cite>", &cache, &blacklist, "").count(), 0);
    }

    #[test]
    fn tag_stripping() {
        assert_eq!(strip_tags("a <b>bold</b> move"), "a bold move");
        assert_eq!(strip_tags("no tags"), "no tags");
        assert_eq!(strip_tags("1 > 0"), "1 > 0");
    }
}
