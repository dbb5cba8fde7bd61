//! Traffic source attribution from UTM parameters and referrers.
//!
//! A session is attributed once, from its entry view. Campaign parameters
//! win over the referrer; a referrer from one of the site's own hosts counts
//! as direct traffic.

use crate::types::TrafficSource;
use url::Url;

/// Campaign-tracking parameters carried by the landing URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtmParams {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
    /// Ad click identifier (gclid, fbclid, msclkid).
    pub click_id: Option<String>,
}

impl UtmParams {
    pub fn has_any(&self) -> bool {
        self.source.is_some()
            || self.medium.is_some()
            || self.campaign.is_some()
            || self.term.is_some()
            || self.content.is_some()
            || self.click_id.is_some()
    }

    /// Parse parameters from a query string, with or without the leading `?`.
    pub fn from_query(query: &str) -> Self {
        let query = query.trim_start_matches('?');
        let mut params = UtmParams::default();

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.to_ascii_lowercase().as_str() {
                "utm_source" => &mut params.source,
                "utm_medium" => &mut params.medium,
                "utm_campaign" => &mut params.campaign,
                "utm_term" => &mut params.term,
                "utm_content" => &mut params.content,
                "gclid" | "fbclid" | "msclkid" => &mut params.click_id,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }

        params
    }

    /// Parameters found in the query part of a page path like `/post?utm_source=x`.
    pub fn from_path(path: &str) -> Self {
        match path.split_once('?') {
            Some((_, query)) => {
                let query = query.split('#').next().unwrap_or("");
                Self::from_query(query)
            }
            None => Self::default(),
        }
    }

    /// Fill any field still missing from `fallback`.
    pub fn or(self, fallback: UtmParams) -> Self {
        UtmParams {
            source: self.source.or(fallback.source),
            medium: self.medium.or(fallback.medium),
            campaign: self.campaign.or(fallback.campaign),
            term: self.term.or(fallback.term),
            content: self.content.or(fallback.content),
            click_id: self.click_id.or(fallback.click_id),
        }
    }
}

/// Lowercased hostname of a referrer URL, if it has one.
pub fn referrer_host(referrer: &str) -> Option<String> {
    let referrer = referrer.trim();
    if referrer.is_empty() {
        return None;
    }

    if let Ok(url) = Url::parse(referrer) {
        return url.host_str().map(|h| h.to_ascii_lowercase());
    }

    // Schemeless referrers like "news.ycombinator.com/item?id=1"
    let host = referrer
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if host.is_empty() || !host.contains('.') {
        None
    } else {
        Some(host)
    }
}

const SEARCH_ENGINES: &[&str] = &[
    "google",
    "bing",
    "yahoo",
    "duckduckgo",
    "baidu",
    "yandex",
    "ecosia",
    "qwant",
    "startpage",
    "naver",
    "seznam",
    "kagi",
    "search.brave.com",
];

const SOCIAL_NETWORKS: &[&str] = &[
    "facebook",
    "twitter",
    "instagram",
    "linkedin",
    "pinterest",
    "reddit",
    "tiktok",
    "youtube",
    "tumblr",
    "mastodon",
    "threads",
    "bsky",
    "news.ycombinator.com",
    "t.co",
    "fb.com",
    "lnkd.in",
    "x.com",
];

const MAIL_HOSTS: &[&str] = &[
    "mail.google.com",
    "outlook.live.com",
    "outlook.office.com",
    "mail.yahoo.com",
    "mail.proton.me",
];

/// Entries with a dot match the host or a parent domain; bare names match any label.
fn host_matches(host: &str, entries: &[&str]) -> bool {
    entries.iter().any(|entry| {
        if entry.contains('.') {
            host == *entry || host.ends_with(&format!(".{entry}"))
        } else {
            host.split('.').any(|label| label == *entry)
        }
    })
}

fn is_own_host(host: &str, site_hosts: &[String]) -> bool {
    site_hosts.iter().any(|site| {
        let site = site.trim().to_ascii_lowercase();
        !site.is_empty() && (host == site || host.ends_with(&format!(".{site}")))
    })
}

fn classify_medium(medium: &str) -> Option<TrafficSource> {
    match medium {
        "cpc" | "ppc" | "cpm" | "cpv" | "paid" | "paidsearch" | "paid-search" | "paid_search"
        | "paidsocial" | "paid-social" | "paid_social" | "display" | "banner" | "retargeting" => {
            Some(TrafficSource::Paid)
        }
        "email" | "e-mail" | "e_mail" | "newsletter" => Some(TrafficSource::Email),
        "social" | "social-media" | "social_media" | "sm" | "organic-social" => {
            Some(TrafficSource::Social)
        }
        "organic" | "seo" => Some(TrafficSource::Organic),
        "referral" | "affiliate" | "partner" => Some(TrafficSource::Referral),
        _ => None,
    }
}

fn classify_utm_source(source: &str) -> TrafficSource {
    if source == "newsletter" || source == "email" {
        TrafficSource::Email
    } else if host_matches(source, SEARCH_ENGINES) {
        TrafficSource::Organic
    } else if host_matches(source, SOCIAL_NETWORKS) {
        TrafficSource::Social
    } else {
        TrafficSource::Referral
    }
}

/// Attribute a traffic source for a session's entry view.
pub fn classify(utm: &UtmParams, referrer: Option<&str>, site_hosts: &[String]) -> TrafficSource {
    if utm.click_id.is_some() {
        return TrafficSource::Paid;
    }

    if let Some(medium) = utm.medium.as_deref() {
        if let Some(source) = classify_medium(&medium.trim().to_ascii_lowercase()) {
            return source;
        }
    }

    if let Some(source) = utm.source.as_deref() {
        return classify_utm_source(&source.trim().to_ascii_lowercase());
    }

    let Some(host) = referrer.and_then(referrer_host) else {
        return TrafficSource::Direct;
    };

    if is_own_host(&host, site_hosts) {
        TrafficSource::Direct
    } else if host_matches(&host, MAIL_HOSTS) {
        TrafficSource::Email
    } else if host_matches(&host, SEARCH_ENGINES) {
        TrafficSource::Organic
    } else if host_matches(&host, SOCIAL_NETWORKS) {
        TrafficSource::Social
    } else {
        TrafficSource::Referral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_hosts() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn test_parse_utm_from_query() {
        let utm = UtmParams::from_query("?utm_source=twitter&utm_medium=social&utm_campaign=launch%20day");
        assert_eq!(utm.source.as_deref(), Some("twitter"));
        assert_eq!(utm.medium.as_deref(), Some("social"));
        assert_eq!(utm.campaign.as_deref(), Some("launch day"));
        assert!(utm.term.is_none());
    }

    #[test]
    fn test_parse_utm_from_path_ignores_fragment() {
        let utm = UtmParams::from_path("/posts/hello?utm_source=hn#comments");
        assert_eq!(utm.source.as_deref(), Some("hn"));
        assert!(!UtmParams::from_path("/posts/hello").has_any());
    }

    #[test]
    fn test_explicit_fields_win_over_path() {
        let explicit = UtmParams {
            source: Some("newsletter".to_string()),
            ..Default::default()
        };
        let merged = explicit.or(UtmParams::from_query("utm_source=x&utm_medium=email"));
        assert_eq!(merged.source.as_deref(), Some("newsletter"));
        assert_eq!(merged.medium.as_deref(), Some("email"));
    }

    #[test]
    fn test_referrer_host() {
        assert_eq!(
            referrer_host("https://www.Google.com/search?q=rust"),
            Some("www.google.com".to_string())
        );
        assert_eq!(
            referrer_host("news.ycombinator.com/item?id=1"),
            Some("news.ycombinator.com".to_string())
        );
        assert_eq!(referrer_host(""), None);
        assert_eq!(referrer_host("garbage"), None);
    }

    #[test]
    fn test_no_referrer_is_direct() {
        assert_eq!(
            classify(&UtmParams::default(), None, &no_hosts()),
            TrafficSource::Direct
        );
    }

    #[test]
    fn test_cpc_medium_is_paid() {
        let utm = UtmParams::from_query("utm_source=google&utm_medium=cpc");
        assert_eq!(
            classify(&utm, Some("https://www.google.com/"), &no_hosts()),
            TrafficSource::Paid
        );
    }

    #[test]
    fn test_click_id_is_paid() {
        let utm = UtmParams::from_query("gclid=abc123");
        assert_eq!(classify(&utm, None, &no_hosts()), TrafficSource::Paid);
    }

    #[test]
    fn test_search_referrer_is_organic() {
        assert_eq!(
            classify(
                &UtmParams::default(),
                Some("https://www.google.com/search?q=rust"),
                &no_hosts()
            ),
            TrafficSource::Organic
        );
    }

    #[test]
    fn test_webmail_is_email_not_search() {
        assert_eq!(
            classify(
                &UtmParams::default(),
                Some("https://mail.google.com/mail/u/0/"),
                &no_hosts()
            ),
            TrafficSource::Email
        );
    }

    #[test]
    fn test_social_referrers() {
        for referrer in ["https://t.co/abc", "https://old.reddit.com/r/rust", "https://x.com/someone"] {
            assert_eq!(
                classify(&UtmParams::default(), Some(referrer), &no_hosts()),
                TrafficSource::Social,
                "{referrer}"
            );
        }
    }

    #[test]
    fn test_label_match_does_not_overmatch() {
        // "googleblog.io" is not google, "tinyx.com" is not x.com
        assert_eq!(
            classify(&UtmParams::default(), Some("https://googleblog.io/"), &no_hosts()),
            TrafficSource::Referral
        );
        assert_eq!(
            classify(&UtmParams::default(), Some("https://tinyx.com/"), &no_hosts()),
            TrafficSource::Referral
        );
    }

    #[test]
    fn test_own_host_is_direct() {
        let hosts = vec!["blog.example.com".to_string()];
        assert_eq!(
            classify(
                &UtmParams::default(),
                Some("https://blog.example.com/posts/1"),
                &hosts
            ),
            TrafficSource::Direct
        );
    }

    #[test]
    fn test_unknown_utm_source_is_referral() {
        let utm = UtmParams::from_query("utm_source=some-partner-site");
        assert_eq!(classify(&utm, None, &no_hosts()), TrafficSource::Referral);
    }

    #[test]
    fn test_newsletter_source_is_email() {
        let utm = UtmParams::from_query("utm_source=newsletter");
        assert_eq!(classify(&utm, None, &no_hosts()), TrafficSource::Email);
    }
}
